//! Circuit breaking for the AI judgment call and retry for worker spawn.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;
