use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known anchor event types.
///
/// Event types are free-form strings; these are the ones emitted by the
/// anchor platform itself.
pub mod event_types {
    pub const TRANSACTION_CREATED: &str = "transaction_created";
    pub const TRANSACTION_STATUS_CHANGED: &str = "transaction_status_changed";
    pub const TRANSACTION_ERROR: &str = "transaction_error";
    pub const QUOTE_CREATED: &str = "quote_created";
    pub const CUSTOMER_UPDATED: &str = "customer_updated";
}

/// The unit of work flowing through a session.
///
/// Events are immutable once built: every field is private and only exposed
/// through accessors. The identifier is what downstream consumers use for
/// idempotent de-duplication, so redelivered copies always carry the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl AnchorEvent {
    /// Start building an event of the given type.
    pub fn builder(event_type: impl Into<String>) -> AnchorEventBuilder {
        AnchorEventBuilder::new(event_type)
    }

    /// Unique event identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event type (e.g. `transaction_status_changed`)
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Provider-specific payload
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// When the event was created by the producer
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Producing component, if recorded
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// Builder for [`AnchorEvent`].
#[derive(Debug, Clone)]
pub struct AnchorEventBuilder {
    id: Option<String>,
    event_type: String,
    payload: serde_json::Value,
    created_at: Option<DateTime<Utc>>,
    source: Option<String>,
}

impl AnchorEventBuilder {
    /// Create a new event builder
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            payload: serde_json::Value::Null,
            created_at: None,
            source: None,
        }
    }

    /// Use an explicit identifier instead of a generated one
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the payload
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the payload from a serializable value
    pub fn payload_from<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Override the creation timestamp
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Record the producing component
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Build the event
    pub fn build(self) -> AnchorEvent {
        AnchorEvent {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: self.event_type,
            payload: self.payload,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            source: self.source,
        }
    }
}
