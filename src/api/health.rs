//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::dispatch::{WorkerState, WorkerStatsSnapshot};
use crate::server::AppState;
use crate::service::SessionInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub events_enabled: bool,
    pub sessions: Vec<SessionInfo>,
    pub workers: Vec<WorkerStatsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub totals: DeliveryTotals,
    pub workers: Vec<WorkerStatsSnapshot>,
}

/// Sums over every worker
#[derive(Debug, Default, Serialize)]
pub struct DeliveryTotals {
    pub events_read: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub events_dead_lettered: u64,
    pub events_acked: u64,
    pub transport_errors: u64,
}

impl DeliveryTotals {
    fn from_snapshots(snapshots: &[WorkerStatsSnapshot]) -> Self {
        snapshots.iter().fold(Self::default(), |mut totals, s| {
            totals.events_read += s.events_read;
            totals.events_delivered += s.events_delivered;
            totals.events_failed += s.events_failed;
            totals.events_dead_lettered += s.events_dead_lettered;
            totals.events_acked += s.events_acked;
            totals.transport_errors += s.transport_errors;
            totals
        })
    }
}

fn worker_snapshots(state: &AppState) -> Vec<WorkerStatsSnapshot> {
    state.workers.iter().map(|w| w.snapshot()).collect()
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers = worker_snapshots(&state);
    let sessions = state.event_service.open_sessions().await;

    // A worker only reaches Closed when its session was closed underneath it
    let degraded = workers.iter().any(|w| w.state == WorkerState::Closed)
        || sessions.iter().any(|s| s.closed);
    let status = if degraded { "degraded" } else { "healthy" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        events_enabled: state.event_service.is_enabled(),
        sessions,
        workers,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let workers = worker_snapshots(&state);

    Json(StatsResponse {
        totals: DeliveryTotals::from_snapshots(&workers),
        workers,
    })
}
