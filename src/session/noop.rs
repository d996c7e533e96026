//! Session used when event emission is administratively disabled.

use async_trait::async_trait;

use crate::event::AnchorEvent;
use crate::metrics::SessionMetrics;

use super::{AckMode, CloseSignal, ReadResponse, Session, SessionError, TransportKind};

/// A session that accepts and discards every event.
///
/// Publishing always succeeds, reads never return anything and acks are
/// no-ops, so producers behave exactly as they would against a healthy
/// channel. Nothing here blocks. The only failure mode is the closed-session
/// invariant shared by every transport.
pub struct NoOpSession {
    name: String,
    close: CloseSignal,
}

impl NoOpSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            close: CloseSignal::new(),
        }
    }
}

#[async_trait]
impl Session for NoOpSession {
    fn session_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Noop
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::WholeBatch
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    async fn publish(&self, event: AnchorEvent) -> Result<(), SessionError> {
        if self.close.is_closed() {
            return Err(SessionError::closed(&self.name));
        }

        tracing::info!(session = %self.name, "Sending NoOp");
        tracing::debug!(
            session = %self.name,
            event_id = %event.id(),
            event_type = %event.event_type(),
            "Event published to no-op session and discarded"
        );
        SessionMetrics::record_published(&self.name, TransportKind::Noop);

        Ok(())
    }

    async fn read(&self) -> Result<Option<ReadResponse>, SessionError> {
        if self.close.is_closed() {
            return Err(SessionError::closed(&self.name));
        }

        tracing::trace!(session = %self.name, "Reading from no-op session returns nothing");
        Ok(None)
    }

    async fn ack(&self, response: &ReadResponse) -> Result<(), SessionError> {
        if self.close.is_closed() {
            return Err(SessionError::closed(&self.name));
        }

        for event in response.events() {
            tracing::debug!(
                session = %self.name,
                event_id = %event.id(),
                "Acking event on no-op session"
            );
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.close.close() {
            tracing::debug!(session = %self.name, "Closing no-op session");
        }
        Ok(())
    }
}
