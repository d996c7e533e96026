//! Registry of named sessions.
//!
//! [`EventService`] resolves a channel name to its configured transport,
//! opens the session on first use and hands out the same `Arc` to every
//! caller until the session is closed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{EventsConfig, RedisConfig, Settings};
use crate::infrastructure::resilience::CircuitBreakerConfig;
use crate::metrics::SessionMetrics;
use crate::session::{
    AckMode, MemoryBroker, MemorySession, MemorySessionConfig, NoOpSession, RedisSession,
    RedisSessionConfig, Session, SessionError, TransportKind,
};

#[derive(Debug, Error)]
pub enum EventServiceError {
    /// The channel cannot be opened with the current configuration
    #[error("Event configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Every session that failed to close during [`EventService::close_all`].
#[derive(Debug, Error)]
#[error("Failed to close {} event session(s)", failures.len())]
pub struct CloseAllError {
    pub failures: Vec<(String, SessionError)>,
}

/// Diagnostics view of a tracked session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub transport: TransportKind,
    pub ack_mode: AckMode,
    pub closed: bool,
}

/// Transport handles shared by the sessions a service opens.
#[derive(Clone, Default)]
pub struct Transports {
    pub memory: Arc<MemoryBroker>,
    pub redis: Option<redis::Client>,
}

impl Transports {
    /// Shared memory broker plus a Redis client when Redis is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, EventServiceError> {
        let redis = match &settings.redis {
            Some(config) => Some(redis::Client::open(config.url.as_str()).map_err(|e| {
                EventServiceError::Configuration(format!("invalid redis url '{}': {}", config.url, e))
            })?),
            None => None,
        };

        Ok(Self {
            memory: Arc::new(MemoryBroker::new()),
            redis,
        })
    }

    pub fn memory(broker: Arc<MemoryBroker>) -> Self {
        Self {
            memory: broker,
            redis: None,
        }
    }
}

pub struct EventService {
    events: EventsConfig,
    redis: Option<RedisConfig>,
    transports: Transports,
    sessions: Mutex<HashMap<String, Arc<dyn Session>>>,
}

impl EventService {
    pub fn new(settings: &Settings, transports: Transports) -> Self {
        Self {
            events: settings.events.clone(),
            redis: settings.redis.clone(),
            transports,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Whether event emission is globally enabled
    pub fn is_enabled(&self) -> bool {
        self.events.enabled
    }

    /// Shared memory broker
    pub fn memory_broker(&self) -> &Arc<MemoryBroker> {
        &self.transports.memory
    }

    /// Open session for `name`, opening one if none is tracked or the tracked
    /// one was closed.
    pub async fn session(&self, name: &str) -> Result<Arc<dyn Session>, EventServiceError> {
        if name.trim().is_empty() {
            return Err(EventServiceError::Configuration(
                "session name must not be empty".to_string(),
            ));
        }

        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(name) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            tracing::debug!(session = %name, "Replacing closed session");
            sessions.remove(name);
            SessionMetrics::sessions_closed(1);
        }

        let session = self.open(name)?;
        sessions.insert(name.to_string(), session.clone());
        SessionMetrics::session_opened();

        tracing::info!(
            session = %name,
            transport = %session.kind(),
            ack_mode = ?session.ack_mode(),
            "Opened event session"
        );

        Ok(session)
    }

    /// Session that receives events a worker gives up on.
    ///
    /// Unlike [`session`](Self::session), a channel resolving to the no-op
    /// transport is an error: publishing to it would drop the event.
    pub async fn dead_letter_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Session>, EventServiceError> {
        let session = self.session(name).await?;
        if session.kind() == TransportKind::Noop {
            return Err(EventServiceError::Configuration(format!(
                "dead-letter channel '{}' discards events",
                name
            )));
        }
        Ok(session)
    }

    /// Track a session built outside the service (custom transports).
    /// Returns the session previously tracked under the same name.
    pub async fn register(&self, session: Arc<dyn Session>) -> Option<Arc<dyn Session>> {
        let name = session.session_name().to_string();
        let previous = self.sessions.lock().await.insert(name, session);
        if previous.is_none() {
            SessionMetrics::session_opened();
        }
        previous
    }

    /// Close every tracked session and empty the registry.
    ///
    /// Every session is attempted; failures are collected rather than
    /// stopping at the first one.
    pub async fn close_all(&self) -> Result<(), CloseAllError> {
        let sessions: Vec<(String, Arc<dyn Session>)> =
            self.sessions.lock().await.drain().collect();
        SessionMetrics::sessions_closed(sessions.len());

        let total = sessions.len();
        let mut failures = Vec::new();

        for (name, session) in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(session = %name, error = %e, "Failed to close event session");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            tracing::info!(sessions = total, "Closed all event sessions");
            Ok(())
        } else {
            Err(CloseAllError { failures })
        }
    }

    /// Snapshot of tracked sessions, sorted by name
    pub async fn open_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(name, session)| SessionInfo {
                name: name.clone(),
                transport: session.kind(),
                ack_mode: session.ack_mode(),
                closed: session.is_closed(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn open(&self, name: &str) -> Result<Arc<dyn Session>, EventServiceError> {
        if !self.events.enabled {
            return Ok(Arc::new(NoOpSession::new(name)));
        }

        let channel = self.events.channels.get(name).ok_or_else(|| {
            EventServiceError::Configuration(format!("unknown event channel '{}'", name))
        })?;

        if !channel.enabled {
            return Ok(Arc::new(NoOpSession::new(name)));
        }

        let session: Arc<dyn Session> = match channel.transport.unwrap_or(self.events.default_transport) {
            TransportKind::Noop => Arc::new(NoOpSession::new(name)),
            TransportKind::Memory => Arc::new(MemorySession::new(
                name,
                &self.transports.memory,
                MemorySessionConfig {
                    ack_mode: channel.ack_mode.unwrap_or(AckMode::WholeBatch),
                    batch_size: self.events.batch_size,
                    read_timeout: self.events.read_timeout(),
                },
            )),
            TransportKind::Redis => {
                let (Some(config), Some(client)) = (&self.redis, &self.transports.redis) else {
                    return Err(EventServiceError::Configuration(format!(
                        "channel '{}' uses the redis transport but redis is not configured",
                        name
                    )));
                };

                Arc::new(RedisSession::new(
                    name,
                    client.clone(),
                    RedisSessionConfig {
                        stream_prefix: config.stream_prefix.clone(),
                        consumer_group: config.consumer_group.clone(),
                        consumer_name: config.consumer_name.clone(),
                        ack_mode: channel.ack_mode.unwrap_or(AckMode::PerEvent),
                        batch_size: self.events.batch_size,
                        read_timeout: self.events.read_timeout(),
                        max_stream_length: config.max_stream_length,
                        circuit_breaker: CircuitBreakerConfig {
                            failure_threshold: config.circuit_breaker_failure_threshold,
                            success_threshold: config.circuit_breaker_success_threshold,
                            reset_timeout_ms: config.circuit_breaker_reset_timeout_ms,
                        },
                    },
                ))
            }
        };

        Ok(session)
    }
}
