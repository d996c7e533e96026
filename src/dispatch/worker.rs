use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::config::{DispatchConfig, Settings};
use crate::event::AnchorEvent;
use crate::handler::{EventHandler, HandlerOutcome};
use crate::infrastructure::resilience::{BackoffConfig, ExponentialBackoff};
use crate::metrics::WorkerMetrics;
use crate::service::{EventService, EventServiceError};
use crate::session::{AckMode, ReadResponse, Session, SessionError};

use super::policy::{
    policy_from_config, RedeliveryDecision, RedeliveryPolicy, UnboundedRedelivery,
};
use super::stats::{WorkerState, WorkerStats};

const DEFAULT_FAILURE_RETENTION_CYCLES: u64 = 1_000;

/// Failed deliveries of one event id
#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_seen: u64,
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause after an empty read when the session does not block itself
    pub poll_interval: Duration,
    /// Handlers run concurrently within one batch
    pub max_concurrency: usize,
    /// Backoff after transport errors
    pub backoff: BackoffConfig,
    /// Cycles after which the failure count of an event that was not read
    /// again is forgotten
    pub failure_retention_cycles: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_concurrency: 1,
            backoff: BackoffConfig::default(),
            failure_retention_cycles: DEFAULT_FAILURE_RETENTION_CYCLES,
        }
    }
}

impl From<&DispatchConfig> for WorkerConfig {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_concurrency: config.max_concurrency.max(1),
            backoff: BackoffConfig {
                initial_delay_ms: config.backoff_initial_delay_ms,
                max_delay_ms: config.backoff_max_delay_ms,
                ..Default::default()
            },
            failure_retention_cycles: DEFAULT_FAILURE_RETENTION_CYCLES,
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleStatus {
    /// Nothing was available to read
    #[default]
    Empty,
    /// A batch was read and processed
    Completed,
    /// The transport failed; retry after backoff
    TransportError,
    /// The session is closed; the worker must stop
    Closed,
    /// Shutdown was requested before a batch was read
    Stopped,
}

/// Counts of one read/process/ack cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub read: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub acked: usize,
}

/// Drives one session: read a batch, hand every event to the handler and
/// acknowledge what settled.
///
/// An event is settled once the handler delivered it or the redelivery
/// policy moved it out of the channel. Nothing else is ever acknowledged, so
/// every failure is redelivered by the transport.
pub struct DispatchWorker {
    session: Arc<dyn Session>,
    handler: Arc<dyn EventHandler>,
    policy: Box<dyn RedeliveryPolicy>,
    dead_letter: Option<Arc<dyn Session>>,
    config: WorkerConfig,
    backoff: ExponentialBackoff,
    stats: Arc<WorkerStats>,
    /// Failed deliveries per event id. Cleared once the event settles here,
    /// pruned after `failure_retention_cycles` when another consumer
    /// settled it instead.
    failures: HashMap<String, FailureRecord>,
    cycle: u64,
    shutdown: Option<broadcast::Receiver<()>>,
    stopping: bool,
}

impl DispatchWorker {
    pub fn new(session: Arc<dyn Session>, handler: Arc<dyn EventHandler>) -> Self {
        let config = WorkerConfig::default();
        let stats = Arc::new(WorkerStats::new(session.session_name()));

        Self {
            session,
            handler,
            policy: Box::new(UnboundedRedelivery),
            dead_letter: None,
            backoff: ExponentialBackoff::new(config.backoff.clone()),
            config,
            stats,
            failures: HashMap::new(),
            cycle: 0,
            shutdown: None,
            stopping: false,
        }
    }

    /// Worker for a consumed channel, wired from `dispatch` settings.
    ///
    /// Fails when the channel or its configured dead-letter channel cannot be
    /// opened, so exhausted events are never discarded by accident.
    pub async fn from_settings(
        service: &EventService,
        settings: &Settings,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, EventServiceError> {
        let session = service.session(channel).await?;
        let mut worker = Self::new(session, handler)
            .with_config(WorkerConfig::from(&settings.dispatch))
            .with_policy(policy_from_config(&settings.dispatch));

        if let Some(dead_letter) = settings
            .dispatch
            .dead_letter_channel
            .as_deref()
            .filter(|name| *name != channel)
        {
            worker = worker.with_dead_letter(service.dead_letter_session(dead_letter).await?);
        }

        Ok(worker)
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.backoff = ExponentialBackoff::new(config.backoff.clone());
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn RedeliveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Session receiving events the policy gives up on. Without one such
    /// events are discarded.
    pub fn with_dead_letter(mut self, session: Arc<dyn Session>) -> Self {
        self.dead_letter = Some(session);
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Number of event ids with a pending failure count
    pub fn tracked_failures(&self) -> usize {
        self.failures.len()
    }

    pub fn channel(&self) -> &str {
        self.session.session_name()
    }

    /// Run the worker loop on its own task
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Loop until the session closes or shutdown is signaled.
    pub async fn run(mut self, shutdown: broadcast::Receiver<()>) {
        self.shutdown = Some(shutdown);

        tracing::info!(
            session = %self.channel(),
            transport = %self.session.kind(),
            ack_mode = ?self.session.ack_mode(),
            max_concurrency = self.config.max_concurrency,
            "Dispatch worker started"
        );

        loop {
            let report = self.run_once().await;

            match report.status {
                CycleStatus::Closed | CycleStatus::Stopped => break,
                CycleStatus::Completed => self.backoff.reset(),
                CycleStatus::Empty => {
                    self.backoff.reset();
                    if !self.session.blocks_on_read() && !self.pause(self.config.poll_interval).await {
                        break;
                    }
                }
                CycleStatus::TransportError => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        session = %self.channel(),
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Backing off after transport error"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }

            if self.shutdown_requested() {
                break;
            }
        }

        self.set_state(WorkerState::Closed);
        tracing::info!(session = %self.channel(), "Dispatch worker stopped");
    }

    /// Execute exactly one read/process/ack cycle.
    #[tracing::instrument(name = "dispatch_cycle", skip(self), fields(session = %self.session.session_name()))]
    pub async fn run_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        self.cycle += 1;
        self.prune_failures();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        self.set_state(WorkerState::Reading);
        let read = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                biased;
                _ = shutdown.recv() => None,
                result = self.session.read() => Some(result),
            },
            None => Some(self.session.read().await),
        };

        let Some(read) = read else {
            self.stopping = true;
            self.set_state(WorkerState::Idle);
            report.status = CycleStatus::Stopped;
            return report;
        };

        let response = match read {
            Ok(Some(response)) => response,
            Ok(None) => {
                self.set_state(WorkerState::Idle);
                return report;
            }
            Err(SessionError::Closed { .. }) => {
                tracing::info!(session = %self.channel(), "Session closed, stopping dispatch");
                self.set_state(WorkerState::Closed);
                report.status = CycleStatus::Closed;
                return report;
            }
            Err(e) => {
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session = %self.channel(), error = %e, "Failed to read from session");
                self.set_state(WorkerState::Idle);
                report.status = CycleStatus::TransportError;
                return report;
            }
        };

        report.read = response.len();
        self.stats
            .events_read
            .fetch_add(response.len() as u64, Ordering::Relaxed);
        WorkerMetrics::record_read(self.session.session_name(), response.len());

        self.set_state(WorkerState::Processing);
        let outcomes = self.process(&response).await;

        let mut settled: Vec<&str> = Vec::with_capacity(response.len());
        for (event, outcome) in response.events().iter().zip(outcomes) {
            match outcome {
                HandlerOutcome::Delivered => {
                    report.delivered += 1;
                    self.failures.remove(event.id());
                    settled.push(event.id());
                }
                HandlerOutcome::Failed(reason) => {
                    report.failed += 1;
                    if self.settle_failure(event, &reason).await {
                        report.dead_lettered += 1;
                        settled.push(event.id());
                    }
                }
            }
        }

        self.stats
            .events_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .events_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.stats
            .events_dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);

        self.set_state(WorkerState::Acking);
        match self.acknowledge(&response, &settled).await {
            Ok(acked) => {
                report.acked = acked;
                report.status = CycleStatus::Completed;
                self.set_state(WorkerState::Idle);
            }
            Err(()) => {
                report.status = CycleStatus::Closed;
                self.set_state(WorkerState::Closed);
            }
        }

        report
    }

    async fn process(&self, response: &ReadResponse) -> Vec<HandlerOutcome> {
        if self.config.max_concurrency <= 1 {
            let mut outcomes = Vec::with_capacity(response.len());
            for event in response.events() {
                outcomes.push(self.handle(event).await);
            }
            return outcomes;
        }

        let pending: Vec<_> = response.events().iter().map(|event| self.handle(event)).collect();
        stream::iter(pending)
            .buffered(self.config.max_concurrency)
            .collect()
            .await
    }

    async fn handle(&self, event: &AnchorEvent) -> HandlerOutcome {
        let channel = self.session.session_name();
        let started = Instant::now();
        let outcome = self.handler.handle_event(event).await;
        let latency = started.elapsed().as_secs_f64();

        match &outcome {
            HandlerOutcome::Delivered => WorkerMetrics::record_delivered(channel, latency),
            HandlerOutcome::Failed(reason) => {
                WorkerMetrics::record_failed(channel, latency);
                tracing::warn!(
                    session = %channel,
                    event_id = %event.id(),
                    reason = %reason,
                    "Event delivery failed"
                );
            }
        }

        outcome
    }

    /// Count a failure and apply the policy. Returns true when the event left
    /// the channel and may be acknowledged.
    async fn settle_failure(&mut self, event: &AnchorEvent, reason: &str) -> bool {
        let cycle = self.cycle;
        let failures = {
            let record = self
                .failures
                .entry(event.id().to_string())
                .or_insert(FailureRecord { count: 0, last_seen: cycle });
            record.count += 1;
            record.last_seen = cycle;
            record.count
        };

        if self.policy.on_failure(event, failures) == RedeliveryDecision::Retry {
            return false;
        }

        let channel = self.session.session_name();
        match &self.dead_letter {
            Some(dead_letter) => match dead_letter.publish(event.clone()).await {
                Ok(()) => {
                    tracing::warn!(
                        session = %channel,
                        event_id = %event.id(),
                        failures = failures,
                        dead_letter = %dead_letter.session_name(),
                        "Event moved to dead-letter channel"
                    );
                    WorkerMetrics::record_dead_lettered(channel, "dead_lettered");
                    self.failures.remove(event.id());
                    true
                }
                Err(e) => {
                    tracing::error!(
                        session = %channel,
                        event_id = %event.id(),
                        dead_letter = %dead_letter.session_name(),
                        error = %e,
                        "Failed to publish event to dead-letter channel"
                    );
                    false
                }
            },
            None => {
                tracing::error!(
                    session = %channel,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    failures = failures,
                    reason = %reason,
                    "Event exceeded maximum delivery attempts and was discarded"
                );
                WorkerMetrics::record_dead_lettered(channel, "discarded");
                self.failures.remove(event.id());
                true
            }
        }
    }

    fn prune_failures(&mut self) {
        let cycle = self.cycle;
        let retention = self.config.failure_retention_cycles;
        let before = self.failures.len();
        self.failures
            .retain(|_, record| cycle.saturating_sub(record.last_seen) < retention);

        let pruned = before - self.failures.len();
        if pruned > 0 {
            tracing::debug!(
                session = %self.session.session_name(),
                pruned = pruned,
                "Forgot failure counts of events settled elsewhere"
            );
        }
    }

    /// Commit the settled events. `Err(())` means the session is closed.
    async fn acknowledge(&self, response: &ReadResponse, settled: &[&str]) -> Result<usize, ()> {
        let channel = self.session.session_name();

        let subset;
        let target = if settled.len() == response.len() {
            response
        } else if settled.is_empty() {
            tracing::debug!(session = %channel, "No event settled, batch left for redelivery");
            return Ok(0);
        } else if self.session.ack_mode() == AckMode::PerEvent {
            subset = response.subset(settled.iter().copied());
            &subset
        } else {
            tracing::debug!(
                session = %channel,
                settled = settled.len(),
                total = response.len(),
                "Batch has unsettled events, leaving whole batch for redelivery"
            );
            return Ok(0);
        };

        match self.session.ack(target).await {
            Ok(()) => {
                self.stats
                    .events_acked
                    .fetch_add(target.len() as u64, Ordering::Relaxed);
                WorkerMetrics::record_acked(channel, target.len());
                Ok(target.len())
            }
            Err(e) if e.is_benign() => {
                tracing::debug!(session = %channel, error = %e, "Batch already acknowledged");
                Ok(0)
            }
            Err(SessionError::Closed { .. }) => {
                tracing::info!(session = %channel, "Session closed before acknowledgment, batch will be redelivered");
                Err(())
            }
            Err(e) if e.is_retryable() => {
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session = %channel, error = %e, "Acknowledgment failed, events will be redelivered");
                Ok(0)
            }
            Err(e) => {
                tracing::error!(session = %channel, error = %e, "Acknowledgment rejected");
                Ok(0)
            }
        }
    }

    /// Sleep for `delay`. Returns false if shutdown was signaled meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        let interrupted = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                _ = shutdown.recv() => true,
                _ = tokio::time::sleep(delay) => false,
            },
            None => {
                tokio::time::sleep(delay).await;
                false
            }
        };

        if interrupted {
            self.stopping = true;
        }
        !interrupted
    }

    fn shutdown_requested(&mut self) -> bool {
        if self.stopping {
            return true;
        }

        let requested = match self.shutdown.as_mut() {
            Some(shutdown) => !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        };
        self.stopping = requested;
        requested
    }

    fn set_state(&self, state: WorkerState) {
        self.stats.set_state(state);
        WorkerMetrics::set_state(self.session.session_name(), state as u8);
    }
}
