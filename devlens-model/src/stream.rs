use serde::{Deserialize, Serialize};

use crate::event::{Event, EventCategory, EventSeverity};

/// Per-subscriber delivery filter for the stream fan-out.
///
/// Empty/None fields match everything; `min_gap_ms` and `max_per_sec`
/// throttle live delivery but are bypassed by replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<EventCategory>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severities: Option<Vec<EventSeverity>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_gap_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_per_sec: Option<u32>,
}

impl StreamFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(categories) = &self.categories
            && !categories.contains(&event.category)
        {
            return false;
        }
        if let Some(severities) = &self.severities
            && !severities.contains(&event.severity)
        {
            return false;
        }
        if let Some(sources) = &self.sources
            && !sources.iter().any(|s| s == &event.source)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;

    fn event(category: EventCategory, source: &str) -> Event {
        EventBuilder::new("x:y", category).source(source).build()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = StreamFilter::default();
        assert!(filter.matches(&event(EventCategory::File, "fm")));
        assert!(filter.matches(&event(EventCategory::System, "bus")));
    }

    #[test]
    fn category_and_source_filters_apply() {
        let filter = StreamFilter {
            categories: Some(vec![EventCategory::Git]),
            sources: Some(vec!["git-monitor".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&event(EventCategory::Git, "git-monitor")));
        assert!(!filter.matches(&event(EventCategory::Git, "other")));
        assert!(!filter.matches(&event(EventCategory::File, "git-monitor")));
    }
}
