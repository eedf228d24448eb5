//! Resilience patterns for switchyard-runtime.
//!
//! This module provides:
//! - Circuit breaker to stop calling a failing backend
//! - Retry with exponential backoff and jitter
//! - The fallback chain that composes both across backends
//! - Batch dispatch over a chain with bounded concurrency

mod batch;
mod circuit_breaker;
mod fallback;
mod retry;

pub use batch::{BatchItemResult, BatchReport};
pub use circuit_breaker::{
    BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitState, DEFAULT_HALF_OPEN_MAX_TRIALS, DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD,
};
pub use fallback::{FallbackChain, FallbackChainBuilder, FallbackResult};
pub use retry::{RetryBackoff, RetryPolicy, JITTER_MAX, JITTER_MIN};
