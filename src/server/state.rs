use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::dispatch::WorkerStats;
use crate::service::EventService;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub event_service: Arc<EventService>,
    /// Statistics of the dispatch workers started by `main`
    pub workers: Arc<Vec<Arc<WorkerStats>>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, event_service: Arc<EventService>) -> Self {
        Self {
            settings,
            event_service,
            workers: Arc::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    pub fn with_workers(mut self, workers: Vec<Arc<WorkerStats>>) -> Self {
        self.workers = Arc::new(workers);
        self
    }
}
