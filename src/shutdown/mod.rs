//! Graceful shutdown handling for the relay.
//!
//! The sequence is:
//! 1. Signal every dispatch worker to stop
//! 2. Wait for workers to finish their current cycle (bounded by the drain timeout)
//! 3. Close every session tracked by the [`EventService`]
//!
//! Events read but not yet acknowledged when a worker stops are redelivered
//! on the next start, so stopping early never loses anything.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::service::EventService;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for workers to stop (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles graceful shutdown of dispatch workers and sessions
pub struct GracefulShutdown {
    event_service: Arc<EventService>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(event_service: Arc<EventService>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            event_service,
            shutdown_tx,
            workers: Vec::new(),
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    /// Track worker tasks that must be awaited before sessions are closed
    pub fn with_workers(mut self, workers: impl IntoIterator<Item = JoinHandle<()>>) -> Self {
        self.workers.extend(workers);
        self
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(name = "graceful_shutdown", skip(self))]
    pub async fn execute(mut self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, workers = self.workers.len(), "Starting graceful shutdown - Phase 1: Signaling workers to stop");
        // No receivers just means no worker is running
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Waiting for workers to drain");
        let (stopped, aborted) = self.drain_workers().await;
        result.workers_stopped = stopped;
        result.workers_aborted = aborted;

        tracing::info!("Phase 3: Closing event sessions");
        let sessions = self.event_service.open_sessions().await.len();
        match self.event_service.close_all().await {
            Ok(()) => {
                result.sessions_closed = sessions;
            }
            Err(e) => {
                for (name, error) in &e.failures {
                    tracing::error!(session = %name, error = %error, "Session did not close cleanly");
                }
                result.sessions_closed = sessions.saturating_sub(e.failures.len());
                result.close_failures = e.failures.len();
            }
        }

        result.duration = start.elapsed();
        result.success = result.workers_aborted == 0 && result.close_failures == 0;

        tracing::info!(
            workers_stopped = result.workers_stopped,
            workers_aborted = result.workers_aborted,
            sessions_closed = result.sessions_closed,
            close_failures = result.close_failures,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Await worker tasks; abort whatever is still running after the drain timeout.
    async fn drain_workers(&mut self) -> (usize, usize) {
        let workers = std::mem::take(&mut self.workers);
        let total = workers.len();
        if total == 0 {
            return (0, 0);
        }

        let abort_handles: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        let mut futures: FuturesUnordered<JoinHandle<()>> = workers.into_iter().collect();
        let mut stopped = 0;

        let drain_future = async {
            while let Some(joined) = futures.next().await {
                match joined {
                    Ok(()) => stopped += 1,
                    Err(e) if e.is_panic() => {
                        tracing::error!(error = %e, "Dispatch worker panicked");
                        stopped += 1;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Dispatch worker cancelled");
                        stopped += 1;
                    }
                }
            }
        };

        if timeout(self.config.drain_timeout, drain_future).await.is_err() {
            let remaining = total - stopped;
            tracing::warn!(
                remaining_workers = remaining,
                drain_timeout_ms = self.config.drain_timeout.as_millis(),
                "Worker drain timeout, aborting remaining workers"
            );
            for handle in &abort_handles {
                handle.abort();
            }
            return (stopped, remaining);
        }

        (stopped, 0)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every worker stopped in time and every session closed
    pub success: bool,
    /// Workers that finished within the drain timeout
    pub workers_stopped: usize,
    /// Workers aborted after the drain timeout
    pub workers_aborted: usize,
    /// Sessions closed without error
    pub sessions_closed: usize,
    /// Sessions whose close failed
    pub close_failures: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
