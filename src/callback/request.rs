use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::AnchorEvent;

/// Body POSTed to the callback API for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEventRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 creation time of the event
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl From<&AnchorEvent> for SendEventRequest {
    fn from(event: &AnchorEvent) -> Self {
        Self {
            id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            timestamp: event.created_at(),
            payload: event.payload().clone(),
        }
    }
}
