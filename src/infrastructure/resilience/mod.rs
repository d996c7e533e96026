//! Transport resilience primitives.
//!
//! - `CircuitBreaker`: fails transport calls fast while a backend is down
//! - `ExponentialBackoff`: spaces out retries after transport errors

mod backoff;
mod circuit_breaker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
