//! In-process session backed by a shared memory broker.
//!
//! Events live in a per-channel queue inside [`MemoryBroker`]; every
//! [`MemorySession`] opened on the same broker and channel name sees the same
//! queue. Events are lost on process restart.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};

use crate::event::AnchorEvent;
use crate::metrics::SessionMetrics;

use super::{AckMode, CloseSignal, ReadResponse, Session, SessionError, TransportKind};

/// Number of acknowledged batches remembered for duplicate-ack detection.
const ACK_HISTORY_LIMIT: usize = 1024;

/// Configuration for a memory session
#[derive(Debug, Clone)]
pub struct MemorySessionConfig {
    /// Acknowledgment granularity
    pub ack_mode: AckMode,
    /// Maximum number of events returned by one read
    pub batch_size: usize,
    /// How long a read waits for an event when the channel is empty
    pub read_timeout: Duration,
}

impl Default for MemorySessionConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::WholeBatch,
            batch_size: 10,
            read_timeout: Duration::ZERO,
        }
    }
}

/// Queue shared by all sessions of one channel.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    pending: Mutex<VecDeque<AnchorEvent>>,
    notify: Notify,
}

impl MemoryChannel {
    async fn push(&self, event: AnchorEvent) {
        self.pending.lock().await.push_back(event);
        self.notify.notify_one();
    }

    /// Put events back at the head of a locked queue, preserving their order.
    fn requeue(pending: &mut VecDeque<AnchorEvent>, events: Vec<AnchorEvent>) -> usize {
        let count = events.len();
        for event in events.into_iter().rev() {
            pending.push_front(event);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Registry of in-process channels.
///
/// Shared (behind an `Arc`) between every service that should see the same
/// channels, e.g. a producer and a consumer in the same process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    channels: DashMap<String, Arc<MemoryChannel>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel with the given name
    pub fn channel(&self, name: &str) -> Arc<MemoryChannel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryChannel::default()))
            .clone()
    }

    /// Number of events waiting to be read on a channel
    pub async fn pending(&self, name: &str) -> usize {
        let channel = self.channels.get(name).map(|c| c.clone());
        match channel {
            Some(channel) => channel.len().await,
            None => 0,
        }
    }
}

/// A batch handed out by `read` that is not fully acknowledged yet.
#[derive(Debug)]
struct OutstandingBatch {
    entries: Vec<(String, AnchorEvent)>,
}

#[derive(Debug, Default)]
struct ConsumerState {
    next_batch: u64,
    outstanding: BTreeMap<u64, OutstandingBatch>,
    /// Receipts committed per batch, oldest first
    acked: VecDeque<(u64, HashSet<String>)>,
}

impl ConsumerState {
    /// Remove every outstanding batch, returning its unacknowledged events in
    /// the order they were originally read.
    fn release_outstanding(&mut self) -> Vec<AnchorEvent> {
        std::mem::take(&mut self.outstanding)
            .into_values()
            .flat_map(|batch| batch.entries.into_iter().map(|(_, event)| event))
            .collect()
    }

    fn acked_receipts(&self, batch: u64) -> Option<&HashSet<String>> {
        self.acked
            .iter()
            .find(|(id, _)| *id == batch)
            .map(|(_, receipts)| receipts)
    }

    fn record_acked(&mut self, batch: u64, receipts: impl IntoIterator<Item = String>) {
        if let Some((_, existing)) = self.acked.iter_mut().find(|(id, _)| *id == batch) {
            existing.extend(receipts);
            return;
        }

        if self.acked.len() >= ACK_HISTORY_LIMIT {
            self.acked.pop_front();
        }
        self.acked.push_back((batch, receipts.into_iter().collect()));
    }
}

/// Session over a [`MemoryChannel`].
///
/// Un-acknowledged events are put back at the head of the channel when the
/// session reads again or closes, so they are redelivered in order.
pub struct MemorySession {
    name: String,
    channel: Arc<MemoryChannel>,
    config: MemorySessionConfig,
    state: Mutex<ConsumerState>,
    close: CloseSignal,
}

impl MemorySession {
    /// Open a session on the broker channel with the given name.
    pub fn new(name: impl Into<String>, broker: &MemoryBroker, config: MemorySessionConfig) -> Self {
        let name = name.into();
        let channel = broker.channel(&name);
        Self {
            name,
            channel,
            config,
            state: Mutex::new(ConsumerState::default()),
            close: CloseSignal::new(),
        }
    }

    /// Number of events read but not yet acknowledged by this session
    pub async fn in_flight(&self) -> usize {
        self.state
            .lock()
            .await
            .outstanding
            .values()
            .map(|batch| batch.entries.len())
            .sum()
    }

    async fn try_read(&self) -> Option<ReadResponse> {
        // Lock order: consumer state, then channel queue. Nothing leaves
        // `outstanding` until both are held.
        let mut state = self.state.lock().await;
        let mut pending = self.channel.pending.lock().await;

        let requeued = MemoryChannel::requeue(&mut pending, state.release_outstanding());
        if requeued > 0 {
            tracing::debug!(
                session = %self.name,
                count = requeued,
                "Requeueing unacknowledged events for redelivery"
            );
        }

        let count = self.config.batch_size.max(1).min(pending.len());
        let events: Vec<AnchorEvent> = pending.drain(..count).collect();
        let remaining = !pending.is_empty();
        drop(pending);
        if remaining && requeued > 0 {
            self.channel.notify.notify_one();
        }

        if events.is_empty() {
            return None;
        }

        let batch = state.next_batch;
        state.next_batch += 1;

        let entries: Vec<(String, AnchorEvent)> = events
            .into_iter()
            .enumerate()
            .map(|(slot, event)| (format!("{}-{}", batch, slot), event))
            .collect();

        state.outstanding.insert(
            batch,
            OutstandingBatch {
                entries: entries.clone(),
            },
        );

        Some(ReadResponse::new(&self.name, batch, entries))
    }

    async fn read_blocking(&self) -> Result<Option<ReadResponse>, SessionError> {
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;

        loop {
            if let Some(response) = self.try_read().await {
                return Ok(Some(response));
            }

            if self.config.read_timeout.is_zero() {
                return Ok(None);
            }

            // A publish between `try_read` and here leaves a permit behind,
            // so this wakes immediately instead of missing the event.
            if tokio::time::timeout_at(deadline, self.channel.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, response: &ReadResponse) -> Result<(), SessionError> {
        let token = response.token();
        if token.session() != self.name {
            return Err(SessionError::ForeignToken {
                session: self.name.clone(),
                token_session: token.session().to_string(),
            });
        }

        let batch_id = token.batch();
        let mut state = self.state.lock().await;

        let Some(batch) = state.outstanding.get_mut(&batch_id) else {
            let already = state
                .acked_receipts(batch_id)
                .map(|acked| token.receipts().iter().all(|r| acked.contains(r)))
                .unwrap_or(false);

            return Err(if already {
                SessionError::AlreadyAcked {
                    session: self.name.clone(),
                    batch: batch_id,
                }
            } else {
                SessionError::StaleToken {
                    session: self.name.clone(),
                    batch: batch_id,
                }
            });
        };

        let wanted: HashSet<&str> = token.receipts().iter().map(String::as_str).collect();
        let outstanding: HashSet<&str> = batch.entries.iter().map(|(r, _)| r.as_str()).collect();

        if self.config.ack_mode == AckMode::WholeBatch && wanted != outstanding {
            return Err(SessionError::PartialAck {
                session: self.name.clone(),
                batch: batch_id,
            });
        }

        let mut committed = Vec::new();
        batch.entries.retain(|(receipt, _)| {
            if wanted.contains(receipt.as_str()) {
                committed.push(receipt.clone());
                false
            } else {
                true
            }
        });
        let exhausted = batch.entries.is_empty();

        if committed.is_empty() {
            let already = state
                .acked_receipts(batch_id)
                .map(|acked| token.receipts().iter().all(|r| acked.contains(r)))
                .unwrap_or(false);

            return Err(if already {
                SessionError::AlreadyAcked {
                    session: self.name.clone(),
                    batch: batch_id,
                }
            } else {
                SessionError::StaleToken {
                    session: self.name.clone(),
                    batch: batch_id,
                }
            });
        }

        if exhausted {
            state.outstanding.remove(&batch_id);
        }

        tracing::debug!(
            session = %self.name,
            batch = batch_id,
            committed = committed.len(),
            "Acknowledged events"
        );
        state.record_acked(batch_id, committed);

        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn ack_mode(&self) -> AckMode {
        self.config.ack_mode
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn blocks_on_read(&self) -> bool {
        !self.config.read_timeout.is_zero()
    }

    async fn publish(&self, event: AnchorEvent) -> Result<(), SessionError> {
        if self.close.is_closed() {
            return Err(SessionError::closed(&self.name));
        }

        tracing::debug!(
            session = %self.name,
            event_id = %event.id(),
            event_type = %event.event_type(),
            "Event published to memory channel"
        );
        self.channel.push(event).await;
        SessionMetrics::record_published(&self.name, TransportKind::Memory);

        Ok(())
    }

    async fn read(&self) -> Result<Option<ReadResponse>, SessionError> {
        self.close.guard(&self.name, self.read_blocking()).await
    }

    async fn ack(&self, response: &ReadResponse) -> Result<(), SessionError> {
        self.close.guard(&self.name, self.commit(response)).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        if !self.close.close() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let mut pending = self.channel.pending.lock().await;
        let count = MemoryChannel::requeue(&mut pending, state.release_outstanding());
        drop(pending);
        drop(state);
        if count > 0 {
            self.channel.notify.notify_one();
        }

        tracing::debug!(
            session = %self.name,
            requeued = count,
            "Closed memory session"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_event(id: &str) -> AnchorEvent {
        AnchorEvent::builder("payment.completed")
            .id(id)
            .payload(json!({"key": "value"}))
            .build()
    }

    fn create_session(broker: &MemoryBroker, ack_mode: AckMode) -> MemorySession {
        MemorySession::new(
            "payments",
            broker,
            MemorySessionConfig {
                ack_mode,
                batch_size: 10,
                read_timeout: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_read_empty_channel() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        assert!(session.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_read_ack() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-1")).await.unwrap();
        session.publish(create_test_event("evt-2")).await.unwrap();

        let response = session.read().await.unwrap().unwrap();
        let ids: Vec<&str> = response.events().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["evt-1", "evt-2"]);

        session.ack(&response).await.unwrap();
        assert!(session.read().await.unwrap().is_none());
        assert_eq!(session.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_batch_size_limits_read() {
        let broker = MemoryBroker::new();
        let session = MemorySession::new(
            "payments",
            &broker,
            MemorySessionConfig {
                batch_size: 2,
                ..Default::default()
            },
        );

        for i in 0..5 {
            session
                .publish(create_test_event(&format!("evt-{}", i)))
                .await
                .unwrap();
        }

        let response = session.read().await.unwrap().unwrap();
        assert_eq!(response.len(), 2);
        assert_eq!(broker.pending("payments").await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_already_acked() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-1")).await.unwrap();
        let response = session.read().await.unwrap().unwrap();

        session.ack(&response).await.unwrap();
        let second = session.ack(&response).await;

        assert!(matches!(second, Err(SessionError::AlreadyAcked { batch: 0, .. })));
    }

    #[tokio::test]
    async fn test_unacked_batch_is_redelivered() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-2")).await.unwrap();

        let first = session.read().await.unwrap().unwrap();
        assert_eq!(first.events()[0].id(), "evt-2");

        let second = session.read().await.unwrap().unwrap();
        assert_eq!(second.events()[0].id(), "evt-2");
        assert_ne!(first.token().batch(), second.token().batch());

        // The first token no longer refers to an outstanding batch
        assert!(matches!(
            session.ack(&first).await,
            Err(SessionError::StaleToken { .. })
        ));
        session.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_preserves_order_ahead_of_new_events() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-1")).await.unwrap();
        session.publish(create_test_event("evt-2")).await.unwrap();
        let _unacked = session.read().await.unwrap().unwrap();

        session.publish(create_test_event("evt-3")).await.unwrap();

        let response = session.read().await.unwrap().unwrap();
        let ids: Vec<&str> = response.events().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["evt-1", "evt-2", "evt-3"]);
    }

    #[tokio::test]
    async fn test_whole_batch_rejects_partial_token() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-1")).await.unwrap();
        session.publish(create_test_event("evt-2")).await.unwrap();
        let response = session.read().await.unwrap().unwrap();

        let partial = response.subset(["evt-1"]);
        assert!(matches!(
            session.ack(&partial).await,
            Err(SessionError::PartialAck { .. })
        ));
    }

    #[tokio::test]
    async fn test_per_event_ack_redelivers_only_failed() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::PerEvent);

        session.publish(create_test_event("evt-1")).await.unwrap();
        session.publish(create_test_event("evt-2")).await.unwrap();
        let response = session.read().await.unwrap().unwrap();

        session.ack(&response.subset(["evt-2"])).await.unwrap();

        let redelivered = session.read().await.unwrap().unwrap();
        let ids: Vec<&str> = redelivered.events().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["evt-1"]);

        // Acking the already committed event again is benign
        assert!(matches!(
            session.ack(&response.subset(["evt-2"])).await,
            Err(SessionError::AlreadyAcked { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_token_rejected() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);
        let other = MemorySession::new("quotes", &broker, MemorySessionConfig::default());

        other.publish(create_test_event("evt-1")).await.unwrap();
        let response = other.read().await.unwrap().unwrap();

        assert!(matches!(
            session.ack(&response).await,
            Err(SessionError::ForeignToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_sessions_share_channel() {
        let broker = MemoryBroker::new();
        let producer = create_session(&broker, AckMode::WholeBatch);
        let consumer = create_session(&broker, AckMode::WholeBatch);

        producer.publish(create_test_event("evt-1")).await.unwrap();

        let response = consumer.read().await.unwrap().unwrap();
        assert_eq!(response.events()[0].id(), "evt-1");
    }

    #[tokio::test]
    async fn test_close_requeues_in_flight_and_rejects_operations() {
        let broker = MemoryBroker::new();
        let session = create_session(&broker, AckMode::WholeBatch);

        session.publish(create_test_event("evt-1")).await.unwrap();
        let response = session.read().await.unwrap().unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(broker.pending("payments").await, 1);
        assert!(matches!(session.ack(&response).await, Err(SessionError::Closed { .. })));
        assert!(matches!(session.read().await, Err(SessionError::Closed { .. })));
        assert!(matches!(
            session.publish(create_test_event("evt-2")).await,
            Err(SessionError::Closed { .. })
        ));
        // Nothing was published by the rejected call
        assert_eq!(broker.pending("payments").await, 1);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let broker = Arc::new(MemoryBroker::new());
        let session = Arc::new(MemorySession::new(
            "payments",
            &broker,
            MemorySessionConfig {
                read_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        ));

        let reader = session.clone();
        let handle = tokio::spawn(async move { reader.read().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.publish(create_test_event("evt-1")).await.unwrap();

        let response = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(response.events()[0].id(), "evt-1");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out() {
        let broker = MemoryBroker::new();
        let session = MemorySession::new(
            "payments",
            &broker,
            MemorySessionConfig {
                read_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        assert!(session.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_interrupts_blocking_read() {
        let broker = MemoryBroker::new();
        let session = Arc::new(MemorySession::new(
            "payments",
            &broker,
            MemorySessionConfig {
                read_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        ));

        let reader = session.clone();
        let handle = tokio::spawn(async move { reader.read().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("read should return promptly after close")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_close_during_contended_read_keeps_unacked_events() {
        let broker = MemoryBroker::new();
        let session = Arc::new(create_session(&broker, AckMode::WholeBatch));

        session.publish(create_test_event("evt-1")).await.unwrap();
        let _unacked = session.read().await.unwrap().unwrap();

        // A publisher holding the queue stalls the next read mid-way
        let queue = session.channel.pending.lock().await;

        let reader = session.clone();
        let read = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closer = session.clone();
        let close = tokio::spawn(async move { closer.close().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(queue);

        let result = read.await.unwrap();
        assert!(matches!(result, Err(SessionError::Closed { .. })));
        close.await.unwrap().unwrap();

        assert_eq!(broker.pending("payments").await, 1);
        assert_eq!(session.in_flight().await, 0);
    }
}
