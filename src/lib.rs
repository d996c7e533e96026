// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod metrics;

// Domain layer (event delivery)
pub mod callback;
pub mod dispatch;
pub mod event;
pub mod handler;
pub mod service;
pub mod session;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod telemetry;
