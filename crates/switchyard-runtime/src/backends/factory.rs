//! Backend factory pattern for startup-time backend registration.
//!
//! Chain members are described by a `kind` string plus a JSON options
//! object. Each kind is served by one registered factory, so new backends
//! are added by registering a factory rather than editing an enum.
//!
//! ## Usage
//!
//! ```
//! use switchyard_runtime::backends::{BackendRegistry, LlmBackend};
//!
//! let registry = BackendRegistry::with_defaults();
//! let backend = registry
//!     .create("mock", "primary", &serde_json::json!({"latency_ms": 5}))
//!     .unwrap();
//! assert_eq!(backend.name(), "primary");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{LlmBackend, MockBackend, MockOptions};
use crate::config::ConfigError;

/// Factory for creating backends from configuration.
///
/// Each factory validates its own options format and creates backend
/// instances under a unique kind identifier.
pub trait BackendFactory: Send + Sync {
    /// Unique identifier for this backend kind.
    ///
    /// Examples: "mock", "anthropic", "openai"
    fn kind(&self) -> &'static str;

    /// Create a backend named `name` from kind-specific JSON options.
    fn create(&self, name: &str, options: &JsonValue) -> Result<Arc<dyn LlmBackend>, ConfigError>;

    /// Validate options without creating a backend.
    fn validate_config(&self, name: &str, options: &JsonValue) -> Result<(), ConfigError>;

    /// Default options for this kind.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    /// Human-readable description of this backend kind.
    fn description(&self) -> &'static str {
        "LLM backend"
    }
}

/// Registry of available backend factories.
///
/// Populated explicitly at startup; there is no discovery.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with all built-in backends registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MockBackendFactory));
        registry
    }

    /// Register a backend factory.
    ///
    /// If a factory with the same kind already exists, it will be replaced.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    /// Create a backend from kind, chain name and options.
    pub fn create(
        &self,
        kind: &str,
        name: &str,
        options: &JsonValue,
    ) -> Result<Arc<dyn LlmBackend>, ConfigError> {
        self.factory(kind)?.create(name, options)
    }

    /// Validate options for a backend kind.
    pub fn validate(&self, kind: &str, name: &str, options: &JsonValue) -> Result<(), ConfigError> {
        self.factory(kind)?.validate_config(name, options)
    }

    /// List available backend kinds.
    pub fn available_kinds(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a backend kind is registered.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Get default options for a backend kind.
    pub fn default_config(&self, kind: &str) -> Option<JsonValue> {
        self.factories.get(kind).map(|f| f.default_config())
    }

    fn factory(&self, kind: &str) -> Result<&Arc<dyn BackendFactory>, ConfigError> {
        self.factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownBackendKind {
                kind: kind.to_string(),
                available: self.available_kinds().into_iter().map(String::from).collect(),
            })
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.available_kinds())
            .finish()
    }
}

/// Factory for the `mock` kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockBackendFactory;

impl MockBackendFactory {
    fn parse(name: &str, options: &JsonValue) -> Result<MockOptions, ConfigError> {
        let parsed: MockOptions =
            serde_json::from_value(options.clone()).map_err(|e| ConfigError::BackendOptions {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if parsed.input_cost_per_1k < 0.0 || parsed.output_cost_per_1k < 0.0 {
            return Err(ConfigError::BackendOptions {
                name: name.to_string(),
                reason: "prices must not be negative".to_string(),
            });
        }
        Ok(parsed)
    }
}

impl BackendFactory for MockBackendFactory {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn create(&self, name: &str, options: &JsonValue) -> Result<Arc<dyn LlmBackend>, ConfigError> {
        let parsed = Self::parse(name, options)?;
        Ok(Arc::new(MockBackend::from_options(name, parsed)))
    }

    fn validate_config(&self, name: &str, options: &JsonValue) -> Result<(), ConfigError> {
        Self::parse(name, options).map(|_| ())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::to_value(MockOptions::default()).unwrap_or_else(|_| serde_json::json!({}))
    }

    fn description(&self) -> &'static str {
        "Deterministic in-process backend for tests and demos"
    }
}
