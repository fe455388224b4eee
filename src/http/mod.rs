//! HTTP layer: circuit breaking, connection pooling, request execution

pub mod breaker;
pub mod client;
pub mod pool;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{HttpOutcome, PollConfig, RequestSpec, WorkflowHttpClient};
pub use pool::{ConnectionPool, PoolConfig};
