//! Wire messages on the fan-out WebSocket channel.

use devlens_model::{Event, StreamFilter};
use serde::{Deserialize, Serialize};

/// Client -> server control messages:
/// `{"op": "subscribe", "args": {"categories": ["git"], "maxPerSec": 5}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe(Option<StreamFilter>),
    Unsubscribe,
    UpdateFilter(StreamFilter),
    Replay(Option<ReplayArgs>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplayArgs {
    /// Milliseconds since epoch; defaults to the replay window start.
    pub since: Option<i64>,
}

/// Server -> client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerMessage {
    Event {
        event: Event,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        replayed: bool,
    },
    System {
        #[serde(rename = "type")]
        message_type: &'static str,
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
}

impl ServerMessage {
    pub fn system(message_type: &'static str, data: serde_json::Value) -> Self {
        ServerMessage::System { message_type, data }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
