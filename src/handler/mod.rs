//! Event handlers forward a single event to a sink and report the outcome.
//!
//! Handlers never acknowledge and never propagate sink failures; the
//! dispatch worker decides what to commit from the returned
//! [`HandlerOutcome`].

mod callback;

use std::sync::Arc;

use async_trait::async_trait;

use crate::callback::{CallbackApiClient, SinkError};
use crate::config::CallbackApiConfig;
use crate::event::AnchorEvent;

pub use callback::CallbackApiEventHandler;

/// Result of handling one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Delivered,
    Failed(String),
}

impl HandlerOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, HandlerOutcome::Delivered)
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &AnchorEvent) -> HandlerOutcome;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle_event(&self, event: &AnchorEvent) -> HandlerOutcome {
        (**self).handle_event(event).await
    }
}

/// Handler that accepts every event without sending it anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHandler;

#[async_trait]
impl EventHandler for NoOpHandler {
    async fn handle_event(&self, event: &AnchorEvent) -> HandlerOutcome {
        tracing::debug!(event_id = %event.id(), "No-op handler accepted event");
        HandlerOutcome::Delivered
    }
}

/// Handler selected from configuration.
pub enum Handler {
    Callback(CallbackApiEventHandler<CallbackApiClient>),
    NoOp(NoOpHandler),
}

impl Handler {
    /// Callback handler when the callback API is enabled, no-op otherwise.
    pub fn from_settings(config: &CallbackApiConfig) -> Result<Self, SinkError> {
        if !config.enabled {
            tracing::info!(handler = "noop", "Callback API disabled, events will be acknowledged without delivery");
            return Ok(Handler::NoOp(NoOpHandler));
        }

        let client = CallbackApiClient::new(config)?;
        tracing::info!(handler = "callback", endpoint = %client.endpoint(), "Using callback API event handler");
        Ok(Handler::Callback(CallbackApiEventHandler::new(client)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Handler::Callback(_) => "callback",
            Handler::NoOp(_) => "noop",
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle_event(&self, event: &AnchorEvent) -> HandlerOutcome {
        match self {
            Handler::Callback(handler) => handler.handle_event(event).await,
            Handler::NoOp(handler) => handler.handle_event(event).await,
        }
    }
}
