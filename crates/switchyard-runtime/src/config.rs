//! Configuration for the resilience layer.
//!
//! A single [`GatewayConfig`] document carries every tunable: circuit
//! breaker thresholds, retry policy, cache sizing, telemetry windows and
//! the ordered backend chain. It loads from YAML or JSON:
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 5
//!   recovery_timeout: 30s
//! retry:
//!   max_retries: 2
//!   backoff_base: 0.5
//! cache:
//!   max_size: 256
//!   ttl: 1h
//! chain:
//!   - name: primary
//!     kind: mock
//!   - name: secondary
//!     kind: mock
//!     options:
//!       latency_ms: 20
//! ```
//!
//! Durations accept a number of seconds or a humantime string.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use switchyard_core::OptionsError;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::telemetry::TelemetryConfig;

/// Errors from configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("fallback chain must contain at least one backend")]
    EmptyChain,

    #[error("backend '{0}' appears more than once in the chain")]
    DuplicateBackend(String),

    #[error("unknown backend kind '{kind}'. Available: {available:?}")]
    UnknownBackendKind { kind: String, available: Vec<String> },

    #[error("backend '{0}' is not in the chain")]
    UnknownBackend(String),

    #[error("cannot remove '{0}': the chain must keep at least one backend")]
    LastBackend(String),

    #[error("backend '{name}' rejected its options: {reason}")]
    BackendOptions { name: String, reason: String },

    #[error("invalid request: {0}")]
    Request(#[from] OptionsError),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// One member of the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique name within the chain
    pub name: String,

    /// Registered backend kind (e.g. "mock")
    pub kind: String,

    /// Kind-specific options, handed to the backend factory
    #[serde(default = "empty_object")]
    pub options: JsonValue,

    /// Overrides the chain-wide retry policy for this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options: empty_object(),
            retry: None,
        }
    }

    pub fn with_options(mut self, options: JsonValue) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub chain: Vec<BackendSpec>,
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Append a backend to the chain.
    pub fn with_backend(mut self, spec: BackendSpec) -> Self {
        self.chain.push(spec);
        self
    }

    /// Validate every section. An empty chain is allowed here and
    /// rejected only when a chain is built from the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.cache.validate()?;
        self.telemetry.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.chain {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::invalid("chain.name", "backend name must not be empty"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(spec.name.clone()));
            }
            if !spec.options.is_object() {
                return Err(ConfigError::BackendOptions {
                    name: spec.name.clone(),
                    reason: "options must be a mapping".to_string(),
                });
            }
            if let Some(retry) = &spec.retry {
                retry.validate()?;
            }
        }
        Ok(())
    }
}

/// Serde adapter: `Duration` as seconds, also accepting humantime strings.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Repr {
        Secs(f64),
        Text(String),
    }

    impl Repr {
        pub(super) fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            match self {
                Repr::Secs(secs) if secs.is_finite() && secs >= 0.0 => {
                    Duration::try_from_secs_f64(secs).map_err(E::custom)
                }
                Repr::Secs(secs) => Err(E::custom(format!(
                    "duration must be a non-negative number of seconds, got {secs}"
                ))),
                Repr::Text(text) => humantime::parse_duration(text.trim()).map_err(E::custom),
            }
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Repr::deserialize(deserializer)?.into_duration()
    }
}

/// Serde adapter for `Option<Duration>`, same formats as [`duration_secs`].
pub(crate) mod option_duration_secs {
    use super::duration_secs::Repr;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Repr>::deserialize(deserializer)?
            .map(Repr::into_duration::<D::Error>)
            .transpose()
    }
}
