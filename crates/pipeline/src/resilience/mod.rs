//! Failure isolation for remote dependencies
//!
//! Calls to the cloud speech provider are wrapped as
//! `breaker.execute(|| with_retry(..))`: retries absorb a transient blip, and
//! the breaker counts the failure that remains once retries are exhausted.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerError, BreakerPolicy, BreakerStats, CircuitBreaker, CircuitState, StateObserver,
};
pub use retry::{with_retry, RetryPolicy};
