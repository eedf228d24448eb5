//! Deterministic in-process backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use switchyard_core::{
    ChatMessage, CompletionOptions, CompletionResponse, ModelPricing, Role, TokenCounter,
    TokenUsage,
};
use tokio::time::Instant;

use super::{BackendError, LlmBackend};

/// Options accepted by the `mock` backend kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockOptions {
    pub model: String,

    /// Fixed reply text; when absent the backend echoes the last user message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    pub latency_ms: u64,

    /// USD per 1K input tokens
    pub input_cost_per_1k: f64,

    /// USD per 1K output tokens
    pub output_cost_per_1k: f64,

    /// Fail every call with a network error
    pub failing: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            model: "mock-model".to_string(),
            response: None,
            latency_ms: 0,
            input_cost_per_1k: 0.001,
            output_cost_per_1k: 0.002,
            failing: false,
        }
    }
}

/// Scripted mock backend.
///
/// Each call pops the next scripted outcome; once the script is empty the
/// backend falls back to its persistent mode (succeed, or fail with the
/// error set by [`set_failing`](Self::set_failing)).
pub struct MockBackend {
    name: String,
    model: String,
    response: Option<String>,
    latency: Duration,
    pricing: ModelPricing,
    counter: TokenCounter,
    script: Mutex<VecDeque<Option<BackendError>>>,
    failing: Mutex<Option<BackendError>>,
    calls: AtomicU64,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_options(name, MockOptions::default())
    }

    pub fn from_options(name: impl Into<String>, options: MockOptions) -> Self {
        let failing = options
            .failing
            .then(|| BackendError::Http("simulated outage".to_string()));
        Self {
            name: name.into(),
            model: options.model,
            response: options.response,
            latency: Duration::from_millis(options.latency_ms),
            pricing: ModelPricing::per_thousand(
                options.input_cost_per_1k,
                options.output_cost_per_1k,
            ),
            counter: TokenCounter::whitespace(),
            script: Mutex::new(VecDeque::new()),
            failing: Mutex::new(failing),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response = Some(text.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.pricing = ModelPricing::per_thousand(input_per_1k, output_per_1k);
        self
    }

    /// Fail every call from now on (`Some`) or stop failing (`None`).
    /// Scripted outcomes still take precedence.
    pub fn set_failing(&self, error: Option<BackendError>) {
        *self.failing.lock() = error;
    }

    /// Queue one failing call.
    pub fn push_failure(&self, error: BackendError) {
        self.script.lock().push_back(Some(error));
    }

    /// Queue one successful call.
    pub fn push_success(&self) {
        self.script.lock().push_back(None);
    }

    /// Queue `n` failing calls with the same error.
    pub fn fail_next(&self, n: usize, error: BackendError) {
        let mut script = self.script.lock();
        script.extend(std::iter::repeat(Some(error)).take(n));
    }

    /// Number of times `complete` has been invoked.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Option<BackendError> {
        match self.script.lock().pop_front() {
            Some(scripted) => scripted,
            None => self.failing.lock().clone(),
        }
    }

    fn reply_for(&self, messages: &[ChatMessage]) -> String {
        if let Some(text) = &self.response {
            return text.clone();
        }
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("Mock response to: {prompt}")
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, BackendError> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = outcome {
            return Err(error);
        }

        let text = self.reply_for(messages);
        let input_tokens = messages
            .iter()
            .map(|m| self.count_tokens(&m.content))
            .fold(0, u32::saturating_add);
        let output_tokens = self.count_tokens(&text);
        let model = options.model.clone().unwrap_or_else(|| self.model.clone());

        Ok(CompletionResponse {
            text,
            usage: TokenUsage::new(input_tokens, output_tokens),
            cost: self.estimate_cost(input_tokens, output_tokens),
            latency: start.elapsed(),
            backend: self.name.clone(),
            model,
            stop_reason: Some("end_turn".to_string()),
        })
    }

    fn count_tokens(&self, text: &str) -> u32 {
        self.counter.count(text)
    }

    fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        self.pricing.cost(input_tokens, output_tokens)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::collect_stream;

    fn ask(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::system("be brief"), ChatMessage::user(text)]
    }

    #[tokio::test]
    async fn test_echoes_last_user_message() {
        let backend = MockBackend::new("mock");
        let response = backend
            .complete(&ask("hello there"), &CompletionOptions::default())
            .await
            .unwrap();

        assert_eq!(response.text, "Mock response to: hello there");
        assert_eq!(response.backend, "mock");
        assert_eq!(response.model, "mock-model");
        // "be brief" + "hello there"
        assert_eq!(response.usage.input_tokens, 4);
        assert_eq!(response.usage.output_tokens, 5);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_per_thousand_pricing() {
        let backend = MockBackend::new("mock")
            .with_response("one two")
            .with_pricing(1.0, 2.0);
        let response = backend
            .complete(&[ChatMessage::user("a b c d")], &CompletionOptions::default())
            .await
            .unwrap();
        // 4 in at $1/1K + 2 out at $2/1K
        assert!((response.cost - 0.008).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_requested_model_wins() {
        let backend = MockBackend::new("mock");
        let options = CompletionOptions::default().with_model("mock-large");
        let response = backend.complete(&ask("x"), &options).await.unwrap();
        assert_eq!(response.model, "mock-large");
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_persistent_mode() {
        let backend = MockBackend::new("mock");
        backend.fail_next(2, BackendError::Timeout(Duration::from_secs(1)));
        backend.push_success();
        backend.set_failing(Some(BackendError::Auth));

        let options = CompletionOptions::default();
        assert!(matches!(
            backend.complete(&ask("x"), &options).await,
            Err(BackendError::Timeout(_))
        ));
        assert!(backend.complete(&ask("x"), &options).await.is_err());
        assert!(backend.complete(&ask("x"), &options).await.is_ok());
        assert_eq!(
            backend.complete(&ask("x"), &options).await.unwrap_err(),
            BackendError::Auth
        );

        backend.set_failing(None);
        assert!(backend.complete(&ask("x"), &options).await.is_ok());
        assert_eq!(backend.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_measured() {
        let backend = MockBackend::new("slow").with_latency(Duration::from_millis(250));
        let response = backend
            .complete(&ask("x"), &CompletionOptions::default())
            .await
            .unwrap();
        assert!(response.latency >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_default_stream_replays_tokens() {
        let backend = MockBackend::new("mock").with_response("streamed reply text");
        let messages = ask("x");
        let options = CompletionOptions::default();

        let text = collect_stream(backend.stream(&messages, &options))
            .await
            .unwrap();
        assert_eq!(text, "streamed reply text");

        backend.push_failure(BackendError::Http("reset".into()));
        let err = collect_stream(backend.stream(&messages, &options))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Http("reset".into()));
    }

    #[test]
    fn test_options_reject_unknown_fields() {
        let parsed: Result<MockOptions, _> =
            serde_json::from_value(serde_json::json!({"latency": 5}));
        assert!(parsed.is_err());

        let parsed: MockOptions =
            serde_json::from_value(serde_json::json!({"latency_ms": 5})).unwrap();
        assert_eq!(parsed.latency_ms, 5);
        assert_eq!(parsed.model, "mock-model");
    }
}
