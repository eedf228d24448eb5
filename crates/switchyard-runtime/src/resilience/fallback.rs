//! Ordered fallback across backends.
//!
//! A [`FallbackChain`] tries its backends in order. Each backend is gated
//! by its own circuit breaker and retried under its own [`RetryPolicy`]
//! before the chain moves on, so a transient hiccup on the preferred
//! backend does not waste a fallback slot. Successful responses are cached
//! and every completed attempt is recorded in telemetry.

use backon::Retryable;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{CompletionOptions, CompletionRequest, CompletionResponse};
use thiserror::Error;
use tokio::time::Instant;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError};
use super::retry::RetryPolicy;
use crate::backends::{BackendError, BackendRegistry, LlmBackend};
use crate::cache::{CacheConfig, ResponseCache};
use crate::config::{ConfigError, GatewayConfig};
use crate::telemetry::{CallRecord, TelemetryCollector, TelemetryConfig};
use crate::GatewayError;

/// Successful outcome of a chain call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackResult {
    pub response: CompletionResponse,

    /// Chain member that produced (or originally produced, if cached) the response
    pub successful_backend: String,

    /// Backend invocations made by this call, across all backends
    pub attempts: u32,

    /// One formatted entry per backend that failed or was skipped, in chain order
    pub errors: Vec<String>,

    /// Served from the response cache without invoking a backend
    pub cached: bool,
}

/// One chain member and the breaker it owns.
struct ChainEntry {
    name: String,
    backend: Arc<dyn LlmBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ChainEntry {
    fn model_for(&self, options: &CompletionOptions) -> String {
        options
            .model
            .clone()
            .unwrap_or_else(|| self.backend.default_model().to_string())
    }

    fn fingerprint(&self, request: &CompletionRequest) -> String {
        ResponseCache::make_fingerprint(
            &self.name,
            &self.model_for(&request.options),
            &request.messages,
            request.options.temperature,
        )
    }
}

#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    #[error(transparent)]
    Backend(BackendError),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Backend(e) if e.is_transient())
    }
}

/// Everything one backend's retry loop produced.
struct BackendRun {
    result: Result<CompletionResponse, AttemptError>,
    invocations: u32,
    last_error: Option<BackendError>,
}

impl BackendRun {
    /// Error-list entry for a failed run. A run cut short by the circuit
    /// opening reports the last real backend error.
    fn error_entry(&self, name: &str) -> Option<String> {
        let detail = match (&self.result, &self.last_error) {
            (Ok(_), _) => return None,
            (Err(_), Some(error)) => error.to_string(),
            (Err(AttemptError::CircuitOpen(e)), None) => e.to_string(),
            (Err(AttemptError::Backend(e)), None) => e.to_string(),
            (Err(AttemptError::DeadlineExceeded), None) => return None,
        };
        Some(if self.invocations > 1 {
            format!("{name}: {detail} (after {} attempts)", self.invocations)
        } else {
            format!("{name}: {detail}")
        })
    }
}

/// Ordered, resilient dispatch across backends.
///
/// Safe to share between concurrent callers (`Arc<FallbackChain>`). No
/// lock is held while a backend is called.
pub struct FallbackChain {
    entries: RwLock<Vec<Arc<ChainEntry>>>,
    breaker_config: CircuitBreakerConfig,
    default_retry: RetryPolicy,
    cache: Option<Arc<ResponseCache>>,
    telemetry: Arc<TelemetryCollector>,
}

impl FallbackChain {
    pub fn builder() -> FallbackChainBuilder {
        FallbackChainBuilder::new()
    }

    /// Build a chain from configuration, creating backends through `registry`.
    pub fn from_config(
        config: &GatewayConfig,
        registry: &BackendRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut builder = Self::builder()
            .circuit_breaker(config.circuit_breaker.clone())
            .retry(config.retry.clone())
            .cache(config.cache.clone())
            .telemetry_config(config.telemetry.clone());

        for spec in &config.chain {
            let backend = registry.create(&spec.kind, &spec.name, &spec.options)?;
            builder = match &spec.retry {
                Some(retry) => builder.backend_with_retry(backend, retry.clone()),
                None => builder.backend(backend),
            };
        }
        builder.build()
    }

    /// Run a request through the chain.
    pub async fn execute(
        &self,
        request: &CompletionRequest,
    ) -> Result<FallbackResult, GatewayError> {
        self.run(request, None).await
    }

    /// Run a request that must finish by `deadline`.
    ///
    /// The deadline bounds every attempt and every backoff sleep. An
    /// attempt cut short counts as a failed (timed out) attempt.
    pub async fn execute_with_deadline(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
    ) -> Result<FallbackResult, GatewayError> {
        self.run(request, Some(deadline)).await
    }

    pub async fn execute_with_timeout(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<FallbackResult, GatewayError> {
        self.run(request, Instant::now().checked_add(timeout)).await
    }

    /// Run a request on one named member only, without fallback.
    pub async fn execute_on(
        &self,
        name: &str,
        request: &CompletionRequest,
    ) -> Result<FallbackResult, GatewayError> {
        request.validate().map_err(ConfigError::from)?;
        let entry = self
            .entry(name)
            .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))?;

        if let Some(hit) = self.cached(std::slice::from_ref(&entry), request) {
            return Ok(hit);
        }

        let run = self.run_backend(&entry, request, None).await;
        let entry_error = run.error_entry(&entry.name);
        match run.result {
            Ok(response) => {
                self.store(&entry, request, &response);
                Ok(FallbackResult {
                    response,
                    successful_backend: entry.name.clone(),
                    attempts: run.invocations,
                    errors: Vec::new(),
                    cached: false,
                })
            }
            Err(AttemptError::DeadlineExceeded) => Err(GatewayError::DeadlineExceeded {
                errors: entry_error.into_iter().collect(),
            }),
            Err(AttemptError::CircuitOpen(e)) if run.last_error.is_none() => {
                Err(GatewayError::CircuitOpen { backend: e.backend })
            }
            Err(AttemptError::CircuitOpen(_)) | Err(AttemptError::Backend(_)) => {
                match run.last_error {
                    Some(source) => Err(GatewayError::Backend {
                        backend: entry.name.clone(),
                        source,
                    }),
                    None => Err(GatewayError::AllBackendsExhausted {
                        errors: entry_error.into_iter().collect(),
                    }),
                }
            }
        }
    }

    async fn run(
        &self,
        request: &CompletionRequest,
        deadline: Option<Instant>,
    ) -> Result<FallbackResult, GatewayError> {
        request.validate().map_err(ConfigError::from)?;
        let entries = self.snapshot();

        if let Some(hit) = self.cached(&entries, request) {
            return Ok(hit);
        }

        let mut errors = Vec::new();
        let mut attempts = 0;

        for entry in &entries {
            let run = self.run_backend(entry, request, deadline).await;
            attempts += run.invocations;
            let entry_error = run.error_entry(&entry.name);

            match run.result {
                Ok(response) => {
                    self.store(entry, request, &response);
                    tracing::debug!(
                        backend = %entry.name,
                        attempts,
                        skipped = errors.len(),
                        "request served"
                    );
                    return Ok(FallbackResult {
                        response,
                        successful_backend: entry.name.clone(),
                        attempts,
                        errors,
                        cached: false,
                    });
                }
                Err(AttemptError::DeadlineExceeded) => {
                    errors.extend(entry_error);
                    tracing::warn!(backend = %entry.name, attempts, "deadline exceeded");
                    return Err(GatewayError::DeadlineExceeded { errors });
                }
                Err(AttemptError::CircuitOpen(_)) if run.invocations == 0 => {
                    tracing::debug!(backend = %entry.name, "circuit open, skipping backend");
                    errors.extend(entry_error);
                }
                Err(_) => {
                    tracing::warn!(
                        backend = %entry.name,
                        attempts = run.invocations,
                        "backend exhausted, falling back"
                    );
                    errors.extend(entry_error);
                }
            }
        }

        tracing::warn!(backends = entries.len(), attempts, "all backends exhausted");
        Err(GatewayError::AllBackendsExhausted { errors })
    }

    /// One backend's bounded retry loop.
    async fn run_backend(
        &self,
        entry: &ChainEntry,
        request: &CompletionRequest,
        deadline: Option<Instant>,
    ) -> BackendRun {
        let invocations = AtomicU32::new(0);
        let last_error: Mutex<Option<BackendError>> = Mutex::new(None);
        let model = entry.model_for(&request.options);

        let (invocations_ref, last_error_ref, model) = (&invocations, &last_error, model.as_str());
        let attempt = move || async move {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(AttemptError::DeadlineExceeded);
            }
            let permit = entry.breaker.try_acquire().map_err(AttemptError::CircuitOpen)?;
            let attempt = invocations_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let start = Instant::now();

            match invoke(entry, request, deadline).await {
                Ok(response) => {
                    permit.success();
                    self.telemetry.record(CallRecord::success(&response));
                    Ok(response)
                }
                Err(error) => {
                    permit.failure();
                    tracing::warn!(
                        backend = %entry.name,
                        attempt,
                        error = %error,
                        "backend attempt failed"
                    );
                    self.telemetry.record(CallRecord::failure(
                        entry.name.as_str(),
                        model,
                        start.elapsed(),
                        error.kind(),
                    ));
                    *last_error_ref.lock() = Some(error.clone());
                    Err(AttemptError::Backend(error))
                }
            }
        };

        let result = attempt
            .retry(entry.retry.clone())
            .sleep(move |delay: Duration| tokio::time::sleep_until(wake_at(delay, deadline)))
            .when(AttemptError::is_retryable)
            .notify(|error: &AttemptError, delay: Duration| {
                tracing::debug!(
                    backend = %entry.name,
                    error = %error,
                    delay = ?delay,
                    "retrying backend"
                );
            })
            .await;

        BackendRun {
            result,
            invocations: invocations.into_inner(),
            last_error: last_error.into_inner(),
        }
    }

    /// First live cache hit among `entries`, in order. Counts as one
    /// cache lookup however many members are checked.
    fn cached(
        &self,
        entries: &[Arc<ChainEntry>],
        request: &CompletionRequest,
    ) -> Option<FallbackResult> {
        let cache = self.cache.as_ref()?;
        let keys: Vec<String> = entries.iter().map(|e| e.fingerprint(request)).collect();
        let (index, response) = cache.get_first(keys.iter().map(String::as_str))?;
        Some(FallbackResult {
            response,
            successful_backend: entries[index].name.clone(),
            attempts: 0,
            errors: Vec::new(),
            cached: true,
        })
    }

    fn store(
        &self,
        entry: &ChainEntry,
        request: &CompletionRequest,
        response: &CompletionResponse,
    ) {
        if let Some(cache) = &self.cache {
            cache.put(entry.fingerprint(request), response.clone());
        }
    }

    fn snapshot(&self) -> Vec<Arc<ChainEntry>> {
        self.entries.read().clone()
    }

    fn entry(&self, name: &str) -> Option<Arc<ChainEntry>> {
        self.entries.read().iter().find(|e| e.name == name).cloned()
    }

    /// Append a backend using the chain-wide retry policy.
    ///
    /// Returns false, leaving the chain unchanged, if a backend with the
    /// same name is already present.
    pub fn add_backend(&self, backend: Arc<dyn LlmBackend>) -> bool {
        self.add_backend_with_retry(backend, self.default_retry.clone())
    }

    pub fn add_backend_with_retry(&self, backend: Arc<dyn LlmBackend>, retry: RetryPolicy) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == backend.name()) {
            return false;
        }
        entries.push(Arc::new(new_entry(backend, &self.breaker_config, retry)));
        true
    }

    /// Remove a backend. The last remaining backend cannot be removed.
    pub fn remove_backend(&self, name: &str) -> Result<(), ConfigError> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))?;
        if entries.len() == 1 {
            return Err(ConfigError::LastBackend(name.to_string()));
        }
        entries.remove(index);
        Ok(())
    }

    /// Member names in chain order.
    pub fn backends(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.entry(name).map(|e| Arc::clone(&e.breaker))
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    /// Health of every member, checked concurrently.
    pub async fn health(&self) -> BTreeMap<String, bool> {
        let entries = self.snapshot();
        let checks = entries
            .iter()
            .map(|e| async move { (e.name.clone(), e.backend.health_check().await) });
        join_all(checks).await.into_iter().collect()
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("backends", &self.backends())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

fn new_entry(
    backend: Arc<dyn LlmBackend>,
    breaker_config: &CircuitBreakerConfig,
    retry: RetryPolicy,
) -> ChainEntry {
    let name = backend.name().to_string();
    ChainEntry {
        breaker: Arc::new(CircuitBreaker::new(name.clone(), breaker_config.clone())),
        name,
        backend,
        retry,
    }
}

/// Call the backend once, bounded by the per-call timeout and the deadline.
async fn invoke(
    entry: &ChainEntry,
    request: &CompletionRequest,
    deadline: Option<Instant>,
) -> Result<CompletionResponse, BackendError> {
    let start = Instant::now();
    let per_attempt = request.options.timeout.and_then(|t| start.checked_add(t));
    let cutoff = match (per_attempt, deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let call = entry.backend.complete(&request.messages, &request.options);
    match cutoff {
        Some(at) => tokio::time::timeout_at(at, call)
            .await
            .unwrap_or_else(|_| Err(BackendError::Timeout(start.elapsed()))),
        None => call.await,
    }
}

/// When a backoff sleep of `delay` should end, never past the deadline.
fn wake_at(delay: Duration, deadline: Option<Instant>) -> Instant {
    let now = Instant::now();
    let wake = now
        .checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30));
    match deadline {
        Some(deadline) => wake.min(deadline),
        None => wake,
    }
}

/// Builder for [`FallbackChain`].
pub struct FallbackChainBuilder {
    backends: Vec<(Arc<dyn LlmBackend>, Option<RetryPolicy>)>,
    breaker_config: CircuitBreakerConfig,
    retry: RetryPolicy,
    cache: CacheSetting,
    telemetry: Option<Arc<TelemetryCollector>>,
    telemetry_config: TelemetryConfig,
}

enum CacheSetting {
    Config(CacheConfig),
    Shared(Arc<ResponseCache>),
}

impl FallbackChainBuilder {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            breaker_config: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheSetting::Config(CacheConfig::default()),
            telemetry: None,
            telemetry_config: TelemetryConfig::default(),
        }
    }

    /// Append a backend using the chain-wide retry policy.
    pub fn backend(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.backends.push((backend, None));
        self
    }

    /// Append a backend with its own retry policy.
    pub fn backend_with_retry(mut self, backend: Arc<dyn LlmBackend>, retry: RetryPolicy) -> Self {
        self.backends.push((backend, Some(retry)));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Chain-wide retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = CacheSetting::Config(config);
        self
    }

    /// Use an existing cache, e.g. one shared between chains.
    pub fn shared_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = CacheSetting::Shared(cache);
        self
    }

    pub fn without_cache(self) -> Self {
        self.cache(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    /// Use an existing collector, e.g. one shared between chains.
    pub fn telemetry(mut self, telemetry: Arc<TelemetryCollector>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn telemetry_config(mut self, config: TelemetryConfig) -> Self {
        self.telemetry_config = config;
        self
    }

    /// Build the chain.
    pub fn build(self) -> Result<FallbackChain, ConfigError> {
        self.breaker_config.validate()?;
        self.retry.validate()?;
        if self.backends.is_empty() {
            return Err(ConfigError::EmptyChain);
        }

        let cache = match self.cache {
            CacheSetting::Config(config) if config.enabled => {
                Some(Arc::new(ResponseCache::from_config(&config)?))
            }
            CacheSetting::Config(_) => None,
            CacheSetting::Shared(cache) => Some(cache),
        };
        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => {
                self.telemetry_config.validate()?;
                Arc::new(TelemetryCollector::new(self.telemetry_config))
            }
        };

        let mut entries: Vec<Arc<ChainEntry>> = Vec::with_capacity(self.backends.len());
        for (backend, retry) in self.backends {
            if entries.iter().any(|e| e.name == backend.name()) {
                return Err(ConfigError::DuplicateBackend(backend.name().to_string()));
            }
            let retry = retry.unwrap_or_else(|| self.retry.clone());
            retry.validate()?;
            entries.push(Arc::new(new_entry(backend, &self.breaker_config, retry)));
        }

        Ok(FallbackChain {
            entries: RwLock::new(entries),
            breaker_config: self.breaker_config,
            default_retry: self.retry,
            cache,
            telemetry,
        })
    }
}

impl Default for FallbackChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}
