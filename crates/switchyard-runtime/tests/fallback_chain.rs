//! End-to-end behavior of a configured fallback chain.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use switchyard_core::{ChatMessage, CompletionOptions, CompletionRequest};
use switchyard_runtime::backends::BackendFactory;
use switchyard_runtime::{
    BackendError, BackendRegistry, CircuitBreakerConfig, CircuitState, ConfigError, FallbackChain,
    GatewayConfig, GatewayError, LlmBackend, MockBackend, RetryPolicy, Window,
};

fn ask(text: &str) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system("You are terse."),
        ChatMessage::user(text),
    ])
}

fn mock(name: &str) -> Arc<MockBackend> {
    Arc::new(MockBackend::new(name))
}

fn chain(backends: &[&Arc<MockBackend>]) -> FallbackChain {
    let mut builder = FallbackChain::builder()
        .retry(RetryPolicy::none())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            ..CircuitBreakerConfig::default()
        });
    for backend in backends {
        builder = builder.backend(Arc::clone(*backend) as Arc<dyn LlmBackend>);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn from_config_builds_working_chain() {
    let config = GatewayConfig::from_yaml(
        r#"
circuit_breaker:
  failure_threshold: 3
retry:
  max_retries: 0
chain:
  - name: primary
    kind: mock
    options:
      response: "primary says hi"
  - name: secondary
    kind: mock
    options:
      model: mock-large
"#,
    )
    .unwrap();

    let chain = FallbackChain::from_config(&config, &BackendRegistry::with_defaults())
        .unwrap();
    assert_eq!(chain.backends(), vec!["primary", "secondary"]);
    assert_eq!(chain.breaker("primary").unwrap().config().failure_threshold, 3);

    let result = chain.execute(&ask("hello")).await.unwrap();
    assert_eq!(result.successful_backend, "primary");
    assert_eq!(result.response.text, "primary says hi");
    assert_eq!(result.attempts, 1);
}

#[test]
fn from_config_rejects_unknown_kind_and_empty_chain() {
    let registry = BackendRegistry::with_defaults();

    let config =
        GatewayConfig::from_yaml("chain:\n  - name: a\n    kind: carrier-pigeon\n").unwrap();
    let err = FallbackChain::from_config(&config, &registry).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::UnknownBackendKind { ref kind, .. } if kind == "carrier-pigeon"
    ));

    let err = FallbackChain::from_config(&GatewayConfig::default(), &registry)
        .unwrap_err();
    assert!(matches!(err, ConfigError::EmptyChain));
}

#[tokio::test]
async fn fallback_attributes_success_to_second_backend() {
    let a = mock("a");
    let b = mock("b");
    a.set_failing(Some(BackendError::Api {
        status: 503,
        message: "overloaded".to_string(),
    }));
    let chain = chain(&[&a, &b]);

    let result = chain.execute(&ask("hello")).await.unwrap();
    assert_eq!(result.successful_backend, "b");
    assert_eq!(result.errors, vec!["a: API error: 503 - overloaded".to_string()]);
}

#[tokio::test]
async fn exhaustion_reports_every_backend_in_order() {
    let a = mock("a");
    let b = mock("b");
    let c = mock("c");
    a.set_failing(Some(BackendError::Timeout(Duration::from_secs(2))));
    b.set_failing(Some(BackendError::RateLimited { retry_after: None }));
    c.set_failing(Some(BackendError::Http("dns failure".to_string())));
    let chain = chain(&[&a, &b, &c]);

    let err = chain.execute(&ask("hello")).await.unwrap_err();
    assert!(matches!(err, GatewayError::AllBackendsExhausted { .. }));
    let prefixes: Vec<&str> = err
        .errors()
        .iter()
        .map(|e| e.split(':').next().unwrap_or_default())
        .collect();
    assert_eq!(prefixes, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_skips_and_recovers() {
    let a = mock("a");
    let b = mock("b");
    let chain = chain(&[&a, &b]);

    a.fail_next(2, BackendError::Http("reset".to_string()));
    chain.execute(&ask("one")).await.unwrap();
    chain.execute(&ask("two")).await.unwrap();
    let breaker = chain.breaker("a").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Open: skipped without a call.
    let result = chain.execute(&ask("three")).await.unwrap();
    assert_eq!(result.successful_backend, "b");
    assert_eq!(a.calls(), 2);
    assert!(result.errors[0].contains("circuit open"));

    // After the recovery timeout a trial call goes through and closes it.
    tokio::time::advance(Duration::from_secs(30)).await;
    let result = chain.execute(&ask("four")).await.unwrap();
    assert_eq!(result.successful_backend, "a");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.snapshot().times_opened, 1);
}

#[tokio::test]
async fn cache_serves_repeat_requests() {
    let a = mock("a");
    let chain = chain(&[&a]);

    let first = chain.execute(&ask("hello")).await.unwrap();
    let again = chain.execute(&ask("hello")).await.unwrap();

    assert!(!first.cached);
    assert!(again.cached);
    assert_eq!(again.attempts, 0);
    assert_eq!(again.response.text, first.response.text);
    assert_eq!(a.calls(), 1);

    let stats = chain.cache().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);

    // Cached hits are not backend attempts.
    assert_eq!(chain.telemetry().stats_over(Window::All).count, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_aborts_slow_backend_and_fallback() {
    let slow = Arc::new(MockBackend::new("slow").with_latency(Duration::from_secs(10)));
    let also_slow = Arc::new(MockBackend::new("also-slow").with_latency(Duration::from_secs(10)));
    let chain = chain(&[&slow, &also_slow]);

    let err = chain
        .execute_with_timeout(&ask("hello"), Duration::from_secs(2))
        .await
        .unwrap_err();

    let GatewayError::DeadlineExceeded { errors } = err else {
        panic!("expected deadline error");
    };
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("slow: Timeout"));
    assert_eq!(also_slow.calls(), 0);
    assert_eq!(chain.breaker("slow").unwrap().failure_count(), 1);
}

/// Hands out one pre-built backend, so tests can script it after
/// building the chain from configuration.
struct Scripted(Arc<MockBackend>);

impl BackendFactory for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn create(
        &self,
        _name: &str,
        _options: &JsonValue,
    ) -> Result<Arc<dyn LlmBackend>, ConfigError> {
        Ok(Arc::clone(&self.0) as Arc<dyn LlmBackend>)
    }

    fn validate_config(&self, _name: &str, _options: &JsonValue) -> Result<(), ConfigError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn per_backend_retry_override_from_config() {
    let flaky = mock("flaky");
    let mut registry = BackendRegistry::with_defaults();
    registry.register(Arc::new(Scripted(Arc::clone(&flaky))));

    let config = GatewayConfig::from_yaml(
        r#"
retry:
  max_retries: 0
chain:
  - name: flaky
    kind: scripted
    retry:
      max_retries: 2
      backoff_base: 0.5
      jitter: false
  - name: steady
    kind: mock
"#,
    )
    .unwrap();
    let chain = FallbackChain::from_config(&config, &registry).unwrap();

    flaky.fail_next(2, BackendError::Http("reset".to_string()));
    let result = chain.execute(&ask("hello")).await.unwrap();
    assert_eq!(result.successful_backend, "flaky");
    assert_eq!(result.attempts, 3);
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn telemetry_tracks_cost_and_latency() {
    let a = Arc::new(MockBackend::new("a").with_pricing(1.0, 1.0));
    let chain = chain(&[&a]);

    for prompt in ["one", "two", "three", "four"] {
        chain.execute(&ask(prompt)).await.unwrap();
    }

    let stats = chain.telemetry().stats();
    assert_eq!(stats.count, 4);
    assert_eq!(stats.failures, 0);
    assert!(stats.total_cost > 0.0);
    assert!((stats.cost_by_backend["a"] - stats.total_cost).abs() < 1e-12);
    assert!((stats.cost_by_model["mock-model"] - stats.total_cost).abs() < 1e-12);
    assert!(stats.latency.min <= stats.latency.p50 && stats.latency.p50 <= stats.latency.max);
    assert!(stats.projection.monthly >= stats.projection.daily);

    let recent = chain.telemetry().recent(1);
    assert_eq!(recent.len(), 1);
    assert!(recent[0].is_success());
}

#[tokio::test]
async fn invalid_options_are_rejected_before_dispatch() {
    let a = mock("a");
    let chain = chain(&[&a]);

    let request = ask("hello").with_options(CompletionOptions::default().with_temperature(5.0));
    let err = chain.execute(&request).await.unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(ConfigError::Request(_))));
    assert_eq!(a.calls(), 0);
}
