//! Outbound client for the anchor's callback API.
//!
//! [`CallbackSink`] is the seam the callback handler talks to;
//! [`CallbackApiClient`] is the HTTP implementation that POSTs a
//! [`SendEventRequest`] to `{base_url}/event`.

mod auth;
mod client;
mod request;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use auth::{AuthHelper, CallbackClaims};
pub use client::CallbackApiClient;
pub use request::SendEventRequest;

/// Error type for callback delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The endpoint could not be reached
    #[error("Callback API unreachable: {0}")]
    ConnectionRefused(String),

    /// No response within the configured timeout
    #[error("Callback API timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-2xx status
    #[error("Callback API returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Failed to serialize callback request: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other HTTP client failure
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Callback authentication failed: {0}")]
    Auth(String),
}

/// Destination of delivered events.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn send_event(&self, request: &SendEventRequest) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: CallbackSink + ?Sized> CallbackSink for Arc<T> {
    async fn send_event(&self, request: &SendEventRequest) -> Result<(), SinkError> {
        (**self).send_event(request).await
    }
}
