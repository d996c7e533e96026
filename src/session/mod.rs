//! Transport-agnostic session contract.
//!
//! A [`Session`] is a handle to one logical event channel. Producers call
//! [`Session::publish`]; a dispatch worker drives [`Session::read`] and
//! [`Session::ack`]. Implementations:
//!
//! - [`NoOpSession`]: emission disabled, publishes are logged and discarded
//! - [`MemorySession`]: in-process channel over a shared [`MemoryBroker`]
//! - [`RedisSession`]: Redis Streams with a consumer group
//!
//! Delivery is at-least-once: anything read but not acknowledged becomes
//! visible again on a later read.

mod memory;
mod noop;
mod redis_stream;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::event::AnchorEvent;

pub use memory::{MemoryBroker, MemorySession, MemorySessionConfig};
pub use noop::NoOpSession;
pub use redis_stream::{RedisSession, RedisSessionConfig};

/// Errors returned by session operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Operation attempted after `close`
    #[error("Session '{session}' is closed")]
    Closed { session: String },

    /// Transient transport failure (connectivity, broker unavailable)
    #[error("Transport error on session '{session}': {message}")]
    Transport { session: String, message: String },

    /// The referenced events were already committed
    #[error("Batch {batch} on session '{session}' was already acknowledged")]
    AlreadyAcked { session: String, batch: u64 },

    /// The token refers to a batch that is no longer outstanding
    #[error("Ack token for batch {batch} is stale on session '{session}'")]
    StaleToken { session: String, batch: u64 },

    /// The token was issued by a different session
    #[error("Ack token issued by session '{token_session}' presented to session '{session}'")]
    ForeignToken {
        session: String,
        token_session: String,
    },

    /// A partial token was presented to a whole-batch session
    #[error("Session '{session}' only accepts whole-batch acknowledgment (batch {batch})")]
    PartialAck { session: String, batch: u64 },
}

impl SessionError {
    pub fn closed(session: &str) -> Self {
        Self::Closed {
            session: session.to_string(),
        }
    }

    pub fn transport(session: &str, message: impl fmt::Display) -> Self {
        Self::Transport {
            session: session.to_string(),
            message: message.to_string(),
        }
    }

    /// Transient failures the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Errors that must be logged but never treated as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyAcked { .. })
    }
}

/// Transport backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "no_op", alias = "disabled")]
    Noop,
    Memory,
    Redis,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Noop => "noop",
            TransportKind::Memory => "memory",
            TransportKind::Redis => "redis",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity at which a session can commit processed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// One token commits the whole batch; any failure blocks the batch
    #[default]
    WholeBatch,
    /// Individual events of a batch can be committed
    PerEvent,
}

/// Opaque acknowledgment handle produced by a read.
///
/// Carries one transport receipt per event of the response it came from
/// (stream entry ids for Redis, batch-local slots for memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    session: String,
    batch: u64,
    receipts: Vec<String>,
}

impl AckToken {
    /// Name of the session that issued the token
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Batch sequence number within the issuing session
    pub fn batch(&self) -> u64 {
        self.batch
    }

    /// Transport receipts, aligned with the response's events
    pub fn receipts(&self) -> &[String] {
        &self.receipts
    }
}

/// A batch of events returned by [`Session::read`].
#[derive(Debug, Clone)]
pub struct ReadResponse {
    events: Vec<AnchorEvent>,
    token: AckToken,
}

impl ReadResponse {
    /// Build a response from `(receipt, event)` pairs in delivery order.
    pub fn new(session: &str, batch: u64, entries: Vec<(String, AnchorEvent)>) -> Self {
        let (receipts, events) = entries.into_iter().unzip();
        Self {
            events,
            token: AckToken {
                session: session.to_string(),
                batch,
                receipts,
            },
        }
    }

    pub fn events(&self) -> &[AnchorEvent] {
        &self.events
    }

    pub fn token(&self) -> &AckToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate `(receipt, event)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &AnchorEvent)> {
        self.token
            .receipts
            .iter()
            .map(String::as_str)
            .zip(self.events.iter())
    }

    /// Narrow the response to the events whose id is in `event_ids`.
    ///
    /// The resulting token still belongs to the same batch, so it is only
    /// accepted by sessions with [`AckMode::PerEvent`] unless it covers the
    /// whole batch.
    pub fn subset<'a, I>(&self, event_ids: I) -> ReadResponse
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: HashSet<&str> = event_ids.into_iter().collect();
        let entries = self
            .entries()
            .filter(|(_, event)| wanted.contains(event.id()))
            .map(|(receipt, event)| (receipt.to_string(), event.clone()))
            .collect();
        ReadResponse::new(&self.token.session, self.token.batch, entries)
    }
}

/// A handle to a transport channel.
///
/// # Contract
///
/// - `publish` makes the event visible to future reads on the channel
/// - `read` returns `Ok(None)` when nothing is pending (possibly after
///   blocking up to the transport's read timeout)
/// - `ack` commits exactly the events referenced by the response's token;
///   a duplicate ack yields [`SessionError::AlreadyAcked`]
/// - `close` is idempotent; afterwards every other operation fails with
///   [`SessionError::Closed`], and in-flight reads return promptly
#[async_trait]
pub trait Session: Send + Sync {
    /// Channel name, used for diagnostics
    fn session_name(&self) -> &str;

    /// Backing transport
    fn kind(&self) -> TransportKind;

    /// Acknowledgment granularity
    fn ack_mode(&self) -> AckMode;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// Whether `read` already waits internally when the channel is empty
    fn blocks_on_read(&self) -> bool {
        false
    }

    async fn publish(&self, event: AnchorEvent) -> Result<(), SessionError>;

    async fn read(&self) -> Result<Option<ReadResponse>, SessionError>;

    async fn ack(&self, response: &ReadResponse) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Close state shared by session implementations.
///
/// Backed by a `watch` channel so that pending operations can race against
/// the close transition without missing it.
#[derive(Debug)]
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Mark as closed. Returns `true` only for the call that performed the
    /// transition.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Resolves once the signal is closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `operation`, failing with `Closed` if the signal is already closed
    /// or closes while the operation is pending.
    pub async fn guard<F, T>(&self, session: &str, operation: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        if self.is_closed() {
            return Err(SessionError::closed(session));
        }

        tokio::select! {
            biased;
            _ = self.closed() => Err(SessionError::closed(session)),
            result = operation => result,
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(id: &str) -> AnchorEvent {
        AnchorEvent::builder("payment.completed").id(id).build()
    }

    #[test]
    fn test_read_response_subset_keeps_receipts_aligned() {
        let response = ReadResponse::new(
            "payments",
            7,
            vec![
                ("r-1".to_string(), event("evt-1")),
                ("r-2".to_string(), event("evt-2")),
                ("r-3".to_string(), event("evt-3")),
            ],
        );

        let subset = response.subset(["evt-1", "evt-3"]);

        assert_eq!(subset.len(), 2);
        assert_eq!(subset.token().batch(), 7);
        assert_eq!(subset.token().session(), "payments");
        assert_eq!(subset.token().receipts(), &["r-1".to_string(), "r-3".to_string()]);
        assert_eq!(subset.events()[1].id(), "evt-3");
    }

    #[test]
    fn test_error_classification() {
        assert!(SessionError::transport("s", "down").is_retryable());
        assert!(!SessionError::closed("s").is_retryable());
        assert!(SessionError::AlreadyAcked {
            session: "s".to_string(),
            batch: 1
        }
        .is_benign());
        assert!(!SessionError::closed("s").is_benign());
    }

    #[test]
    fn test_close_signal_transitions_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_guard_interrupts_pending_operation() {
        let signal = Arc::new(CloseSignal::new());
        let closer = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let result: Result<(), SessionError> = signal
            .guard("payments", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SessionError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_guard_rejects_after_close() {
        let signal = CloseSignal::new();
        signal.close();

        let result = signal.guard("payments", async { Ok(1) }).await;
        assert!(matches!(result, Err(SessionError::Closed { .. })));
    }

    #[test]
    fn test_transport_kind_deserialize() {
        let kind: TransportKind = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(kind, TransportKind::Redis);
        let kind: TransportKind = serde_json::from_str("\"noop\"").unwrap();
        assert_eq!(kind, TransportKind::Noop);
        let mode: AckMode = serde_json::from_str("\"per_event\"").unwrap();
        assert_eq!(mode, AckMode::PerEvent);
    }
}
