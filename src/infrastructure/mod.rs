//! Infrastructure layer modules
//!
//! - `resilience`: circuit breaker and exponential backoff used by
//!   transports and the dispatch worker

pub mod resilience;
