//! API layer - HTTP endpoint handlers organized by domain.

mod events;
mod health;
mod metrics;
mod routes;

// Re-export all handlers for use in server/app.rs
pub use events::{publish_event, PublishEventRequest, PublishEventResponse};
pub use health::{health, stats, DeliveryTotals, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
