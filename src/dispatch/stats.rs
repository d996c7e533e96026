use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

/// Where a dispatch worker is in its read/process/ack cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Reading = 1,
    Processing = 2,
    Acking = 3,
    Closed = 4,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            1 => WorkerState::Reading,
            2 => WorkerState::Processing,
            3 => WorkerState::Acking,
            4 => WorkerState::Closed,
            _ => WorkerState::Idle,
        }
    }
}

/// Counters of one dispatch worker, shared with the admin API
#[derive(Debug)]
pub struct WorkerStats {
    channel: String,
    state: AtomicU8,
    pub cycles: AtomicU64,
    pub events_read: AtomicU64,
    pub events_delivered: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_dead_lettered: AtomicU64,
    pub events_acked: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl WorkerStats {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            cycles: AtomicU64::new(0),
            events_read: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_dead_lettered: AtomicU64::new(0),
            events_acked: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            channel: self.channel.clone(),
            state: self.state(),
            cycles: self.cycles.load(Ordering::Relaxed),
            events_read: self.events_read.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of worker statistics
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub channel: String,
    pub state: WorkerState,
    pub cycles: u64,
    pub events_read: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub events_dead_lettered: u64,
    pub events_acked: u64,
    pub transport_errors: u64,
}
