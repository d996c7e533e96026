//! Session backed by a Redis Stream and a consumer group.
//!
//! Events are stored as a JSON `data` field on stream entries. Each read
//! first re-reads this consumer's pending entries list (entries delivered
//! before but never `XACK`ed) and only then asks for new entries, so
//! anything left unacknowledged is redelivered, also across restarts as long
//! as the consumer name stays the same.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::{Mutex, RwLock};

use crate::event::AnchorEvent;
use crate::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::metrics::SessionMetrics;

use super::{AckMode, CloseSignal, ReadResponse, Session, SessionError, TransportKind};

/// Number of completed batch ids remembered for duplicate-ack detection.
const COMPLETED_HISTORY_LIMIT: usize = 1024;

/// Configuration for a Redis stream session
#[derive(Debug, Clone)]
pub struct RedisSessionConfig {
    /// Stream key prefix; the channel name is appended
    pub stream_prefix: String,
    /// Consumer group shared by all dispatchers of the channel
    pub consumer_group: String,
    /// Consumer name of this process within the group
    pub consumer_name: String,
    /// Acknowledgment granularity
    pub ack_mode: AckMode,
    /// Maximum number of entries returned by one read
    pub batch_size: usize,
    /// How long `XREADGROUP` blocks when no new entry is available
    pub read_timeout: Duration,
    /// Approximate stream length cap applied on publish
    pub max_stream_length: usize,
    /// Circuit breaker guarding the connection
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RedisSessionConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "anchor:events:".to_string(),
            consumer_group: "anchor-event-relay".to_string(),
            consumer_name: "relay-1".to_string(),
            ack_mode: AckMode::PerEvent,
            batch_size: 10,
            read_timeout: Duration::from_millis(1000),
            max_stream_length: 100_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug)]
struct OutstandingBatch {
    batch: u64,
    remaining: HashSet<String>,
    acked: HashSet<String>,
}

#[derive(Debug, Default)]
struct ConsumerState {
    next_batch: u64,
    current: Option<OutstandingBatch>,
    completed: VecDeque<u64>,
}

impl ConsumerState {
    fn complete(&mut self, batch: u64) {
        if self.completed.len() >= COMPLETED_HISTORY_LIMIT {
            self.completed.pop_front();
        }
        self.completed.push_back(batch);
    }
}

/// Session over a Redis Stream.
///
/// Publishing and acknowledging go through one multiplexed connection,
/// blocking reads through another so that a pending `XREADGROUP` never holds
/// up producers.
pub struct RedisSession {
    name: String,
    stream_key: String,
    client: Client,
    config: RedisSessionConfig,
    commands: RwLock<Option<MultiplexedConnection>>,
    reader: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: CircuitBreaker,
    group_ready: Mutex<bool>,
    state: Mutex<ConsumerState>,
    close: CloseSignal,
}

impl RedisSession {
    /// Create a session for the channel `name`. No connection is made until
    /// the first operation.
    pub fn new(name: impl Into<String>, client: Client, config: RedisSessionConfig) -> Self {
        let name = name.into();
        let stream_key = format!("{}{}", config.stream_prefix, name);
        let circuit_breaker = CircuitBreaker::new(name.clone(), config.circuit_breaker.clone());

        Self {
            name,
            stream_key,
            client,
            config,
            commands: RwLock::new(None),
            reader: RwLock::new(None),
            circuit_breaker,
            group_ready: Mutex::new(false),
            state: Mutex::new(ConsumerState::default()),
            close: CloseSignal::new(),
        }
    }

    /// Redis key of the underlying stream
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Circuit breaker state of the connection
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    async fn get_connection(
        &self,
        slot: &RwLock<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection, SessionError> {
        if !self.circuit_breaker.allow_request() {
            return Err(SessionError::transport(&self.name, "circuit breaker is open"));
        }

        if let Some(conn) = slot.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = slot.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                tracing::info!(session = %self.name, stream = %self.stream_key, "Redis stream connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                SessionMetrics::record_transport_error(&self.name, "connect");
                tracing::error!(session = %self.name, error = %e, "Failed to connect to Redis");
                Err(SessionError::transport(&self.name, e))
            }
        }
    }

    /// Run a command with circuit breaker bookkeeping, dropping the cached
    /// connection when Redis reports it as broken.
    async fn execute<F, T, Fut>(
        &self,
        slot: &RwLock<Option<MultiplexedConnection>>,
        operation: &'static str,
        f: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection(slot).await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *slot.write().await = None;
                }
                self.circuit_breaker.record_failure();
                SessionMetrics::record_transport_error(&self.name, operation);
                tracing::warn!(
                    session = %self.name,
                    operation = operation,
                    error = %e,
                    "Redis stream operation failed"
                );
                Err(SessionError::transport(&self.name, e))
            }
        }
    }

    async fn ensure_group(&self) -> Result<(), SessionError> {
        let mut ready = self.group_ready.lock().await;
        if *ready {
            return Ok(());
        }

        let key = self.stream_key.clone();
        let group = self.config.consumer_group.clone();
        let created = self
            .execute(&self.commands, "create_group", |mut conn| async move {
                match conn.xgroup_create_mkstream::<_, _, _, ()>(&key, &group, "0").await {
                    Ok(()) => Ok(true),
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if created {
            tracing::info!(
                session = %self.name,
                stream = %self.stream_key,
                group = %self.config.consumer_group,
                "Created consumer group"
            );
        }
        *ready = true;
        Ok(())
    }

    /// `XREADGROUP` from `start` (`"0"` for this consumer's pending entries,
    /// `">"` for new ones).
    async fn read_entries(
        &self,
        start: &'static str,
        block: Option<Duration>,
    ) -> Result<Vec<(String, AnchorEvent)>, SessionError> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(self.config.batch_size.max(1));
        if let Some(block) = block {
            options = options.block(block.as_millis().max(1) as usize);
        }

        let key = self.stream_key.clone();
        let reply: Option<StreamReadReply> = self
            .execute(&self.reader, "read", |mut conn| async move {
                conn.xread_options(&[key.as_str()], &[start], &options).await
            })
            .await?;

        let mut entries = Vec::new();
        let mut undecodable = Vec::new();

        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                let decoded = entry
                    .get::<String>("data")
                    .map(|data| serde_json::from_str::<AnchorEvent>(&data));

                match decoded {
                    Some(Ok(event)) => entries.push((entry.id, event)),
                    Some(Err(e)) => {
                        tracing::warn!(
                            session = %self.name,
                            entry_id = %entry.id,
                            error = %e,
                            "Discarding undecodable stream entry"
                        );
                        undecodable.push(entry.id);
                    }
                    None => {
                        // Trimmed by MAXLEN while still pending
                        tracing::warn!(
                            session = %self.name,
                            entry_id = %entry.id,
                            "Discarding stream entry without payload"
                        );
                        undecodable.push(entry.id);
                    }
                }
            }
        }

        if !undecodable.is_empty() {
            self.xack(&undecodable).await?;
        }

        Ok(entries)
    }

    async fn xack(&self, ids: &[String]) -> Result<usize, SessionError> {
        let key = self.stream_key.clone();
        let group = self.config.consumer_group.clone();
        let ids = ids.to_vec();
        self.execute(&self.commands, "ack", |mut conn| async move {
            conn.xack::<_, _, _, usize>(&key, &group, &ids).await
        })
        .await
    }

    async fn read_batch(&self) -> Result<Option<ReadResponse>, SessionError> {
        self.ensure_group().await?;

        let pending = self.read_entries("0", None).await?;
        let entries = if pending.is_empty() {
            let block = (!self.config.read_timeout.is_zero()).then_some(self.config.read_timeout);
            self.read_entries(">", block).await?
        } else {
            tracing::debug!(
                session = %self.name,
                count = pending.len(),
                "Redelivering pending stream entries"
            );
            pending
        };

        if entries.is_empty() {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let batch = state.next_batch;
        state.next_batch += 1;
        state.current = Some(OutstandingBatch {
            batch,
            remaining: entries.iter().map(|(id, _)| id.clone()).collect(),
            acked: HashSet::new(),
        });

        Ok(Some(ReadResponse::new(&self.name, batch, entries)))
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

        let already_acked = SessionError::AlreadyAcked {
            session: self.name.clone(),
            batch: batch_id,
        };
        let stale = SessionError::StaleToken {
            session: self.name.clone(),
            batch: batch_id,
        };

        if state.completed.contains(&batch_id) {
            return Err(already_acked);
        }

        let current = match state.current.as_mut() {
            Some(current) if current.batch == batch_id => current,
            _ => return Err(stale),
        };

        let wanted: HashSet<&String> = token.receipts().iter().collect();
        if self.config.ack_mode == AckMode::WholeBatch
            && (wanted.len() != current.remaining.len()
                || !wanted.iter().all(|id| current.remaining.contains(*id)))
        {
            if !wanted.is_empty() && wanted.iter().all(|id| current.acked.contains(*id)) {
                return Err(already_acked);
            }
            return Err(SessionError::PartialAck {
                session: self.name.clone(),
                batch: batch_id,
            });
        }

        let ids: Vec<String> = wanted
            .iter()
            .filter(|id| current.remaining.contains(**id))
            .map(|id| (*id).clone())
            .collect();

        if ids.is_empty() {
            let all_acked = wanted.iter().all(|id| current.acked.contains(*id));
            return Err(if all_acked { already_acked } else { stale });
        }

        let acknowledged = self.xack(&ids).await?;
        if acknowledged < ids.len() {
            tracing::debug!(
                session = %self.name,
                batch = batch_id,
                requested = ids.len(),
                acknowledged = acknowledged,
                "Some stream entries were no longer pending"
            );
        }

        for id in ids.iter() {
            current.remaining.remove(id);
            current.acked.insert(id.clone());
        }
        let exhausted = current.remaining.is_empty();

        if exhausted {
            state.current = None;
            state.complete(batch_id);
        }

        tracing::debug!(
            session = %self.name,
            batch = batch_id,
            committed = ids.len(),
            "Acknowledged stream entries"
        );

        Ok(())
    }

    async fn append(&self, event: &AnchorEvent) -> Result<String, SessionError> {
        let data = serde_json::to_string(event)
            .map_err(|e| SessionError::transport(&self.name, format!("serialization failed: {}", e)))?;

        let key = self.stream_key.clone();
        let maxlen = StreamMaxlen::Approx(self.config.max_stream_length.max(1));
        self.execute(&self.commands, "publish", |mut conn| async move {
            conn.xadd_maxlen::<_, _, _, _, String>(&key, maxlen, "*", &[("data", data)])
                .await
        })
        .await
    }
}

#[async_trait]
impl Session for RedisSession {
    fn session_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Redis
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
        let entry_id = self.close.guard(&self.name, self.append(&event)).await?;

        tracing::debug!(
            session = %self.name,
            event_id = %event.id(),
            event_type = %event.event_type(),
            entry_id = %entry_id,
            "Event published to Redis stream"
        );
        SessionMetrics::record_published(&self.name, TransportKind::Redis);

        Ok(())
    }

    async fn read(&self) -> Result<Option<ReadResponse>, SessionError> {
        self.close.guard(&self.name, self.read_batch()).await
    }

    async fn ack(&self, response: &ReadResponse) -> Result<(), SessionError> {
        self.close.guard(&self.name, self.commit(response)).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        if !self.close.close() {
            return Ok(());
        }

        *self.reader.write().await = None;
        *self.commands.write().await = None;

        tracing::debug!(session = %self.name, stream = %self.stream_key, "Closed Redis stream session");
        Ok(())
    }
}
