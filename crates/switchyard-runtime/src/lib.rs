//! # switchyard-runtime
//!
//! Resilient dispatch of chat completions across interchangeable LLM
//! backends.
//!
//! A [`FallbackChain`] accepts a request and routes it through an ordered
//! list of backends. Each backend has its own circuit breaker and retry
//! policy; responses are cached by request fingerprint and every attempt
//! is recorded for latency and cost statistics. Callers get either a
//! response plus provenance (which backend, how many attempts) or one
//! terminal error listing every backend's failure.
//!
//! ## Example
//!
//! ```rust
//! use switchyard_runtime::{BackendRegistry, FallbackChain, GatewayConfig};
//! use switchyard_core::{ChatMessage, CompletionRequest};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_yaml(r#"
//! chain:
//!   - name: primary
//!     kind: mock
//!   - name: secondary
//!     kind: mock
//! "#)?;
//! let chain = FallbackChain::from_config(&config, &BackendRegistry::with_defaults())?;
//!
//! let request = CompletionRequest::new(vec![ChatMessage::user("Hello")]);
//! let result = chain.execute(&request).await?;
//! assert_eq!(result.successful_backend, "primary");
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

use thiserror::Error;

pub mod backends;
pub mod cache;
pub mod config;
pub mod resilience;
pub mod telemetry;

pub use backends::{BackendError, BackendRegistry, LlmBackend, MockBackend};
pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use config::{BackendSpec, ConfigError, GatewayConfig};
pub use resilience::{
    BatchItemResult, BatchReport, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    FallbackChain, FallbackResult, RetryPolicy,
};
pub use telemetry::{
    CallRecord, HealthStatus, TelemetryCollector, TelemetryConfig, TelemetryStats, Window,
};

/// Caller-facing errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    #[error("backend '{backend}' failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("all backends exhausted: {}", .errors.join("; "))]
    AllBackendsExhausted { errors: Vec<String> },

    #[error("deadline exceeded: {}", .errors.join("; "))]
    DeadlineExceeded { errors: Vec<String> },
}

impl GatewayError {
    /// Per-backend failure entries, in chain order.
    pub fn errors(&self) -> &[String] {
        match self {
            GatewayError::AllBackendsExhausted { errors }
            | GatewayError::DeadlineExceeded { errors } => errors,
            _ => &[],
        }
    }
}
