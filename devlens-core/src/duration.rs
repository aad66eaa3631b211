//! Serde support for millisecond duration fields.
//!
//! Configuration accepts either a bare integer (milliseconds) or a
//! humantime string ("250ms", "5s", "1h"); values render back as the
//! humantime form. Used with `#[serde(with = "crate::duration")]` on the
//! `*_ms` config fields.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(ms: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(Duration::from_millis(*ms)))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Human(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(ms),
        Raw::Human(text) => humantime::parse_duration(text.trim())
            .map(|duration| duration.as_millis() as u64)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "crate::duration")]
        interval_ms: u64,
    }

    #[test]
    fn accepts_integer_milliseconds() {
        let holder: Holder =
            serde_json::from_value(serde_json::json!({"interval_ms": 1500}))
                .unwrap();
        assert_eq!(holder.interval_ms, 1_500);
    }

    #[test]
    fn accepts_humantime_strings() {
        for (text, expected) in
            [("250ms", 250), ("5s", 5_000), ("2m", 120_000), ("1h", 3_600_000)]
        {
            let holder: Holder =
                serde_json::from_value(serde_json::json!({"interval_ms": text}))
                    .unwrap();
            assert_eq!(holder.interval_ms, expected, "for {text}");
        }
    }

    #[test]
    fn rejects_garbage() {
        let result: Result<Holder, _> =
            serde_json::from_value(serde_json::json!({"interval_ms": "soonish"}));
        assert!(result.is_err());
    }

    #[test]
    fn serializes_as_humantime_and_round_trips() {
        let holder = Holder { interval_ms: 90_000 };
        let value = serde_json::to_value(&holder).unwrap();
        assert_eq!(value["interval_ms"], "1m 30s");
        let back: Holder = serde_json::from_value(value).unwrap();
        assert_eq!(back, holder);
    }
}
