//! Backend abstractions for switchyard-runtime.
//!
//! This module defines the capability every LLM backend offers to the
//! resilience layer, the classified error a backend fails with, and a
//! deterministic mock backend. Backends are created from configuration
//! through the [`BackendRegistry`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use switchyard_core::{ChatMessage, CompletionOptions, CompletionResponse};
use thiserror::Error;

mod factory;
mod mock;

pub use factory::{BackendFactory, BackendRegistry, MockBackendFactory};
pub use mock::{MockBackend, MockOptions};

/// Errors from LLM backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Whether retrying the same backend may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(_) | BackendError::RateLimited { .. } | BackendError::Timeout(_) => {
                true
            }
            BackendError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            BackendError::Parse(_) | BackendError::Auth | BackendError::NotConfigured(_) => false,
        }
    }

    /// Short classification label for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Http(_) => "network",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::Api { .. } => "api",
            BackendError::Parse(_) => "parse",
            BackendError::Auth => "auth",
            BackendError::Timeout(_) => "timeout",
            BackendError::NotConfigured(_) => "not_configured",
        }
    }
}

/// One token of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub index: usize,
    pub token: String,
    /// Set on the terminating chunk, whose token is empty
    pub is_final: bool,
}

/// Split completed text into whitespace tokens plus a final marker chunk.
pub fn split_into_chunks(text: &str) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = text
        .split_whitespace()
        .enumerate()
        .map(|(index, token)| StreamChunk {
            index,
            token: token.to_string(),
            is_final: false,
        })
        .collect();
    chunks.push(StreamChunk {
        index: chunks.len(),
        token: String::new(),
        is_final: true,
    });
    chunks
}

/// Drain a token stream back into text, joining tokens with spaces.
pub async fn collect_stream(
    mut chunks: BoxStream<'_, Result<StreamChunk, BackendError>>,
) -> Result<String, BackendError> {
    let mut tokens = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if chunk.is_final {
            break;
        }
        tokens.push(chunk.token);
    }
    Ok(tokens.join(" "))
}

/// Backend abstraction allows swapping LLM providers.
///
/// The resilience layer only ever talks to backends through this trait.
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a chat completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, BackendError>;

    /// Backend-specific token count approximation.
    fn count_tokens(&self, text: &str) -> u32;

    /// Backend-specific price in USD.
    fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64;

    /// Backend name, unique within a chain.
    fn name(&self) -> &str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    /// Check if backend is healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Stream a completion as tokens.
    ///
    /// The default completes the request and replays the text token by
    /// token; backends with native streaming override this.
    fn stream<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        options: &'a CompletionOptions,
    ) -> BoxStream<'a, Result<StreamChunk, BackendError>> {
        stream::once(self.complete(messages, options))
            .flat_map(|result| {
                let items: Vec<Result<StreamChunk, BackendError>> = match result {
                    Ok(response) => split_into_chunks(&response.text).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Http("reset".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BackendError::RateLimited { retry_after: None }.is_transient());
        assert!(BackendError::Api { status: 503, message: "busy".into() }.is_transient());
        assert!(!BackendError::Api { status: 400, message: "bad".into() }.is_transient());
        assert!(!BackendError::Auth.is_transient());
        assert!(!BackendError::Parse("eof".into()).is_transient());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BackendError::Timeout(Duration::ZERO).kind(), "timeout");
        assert_eq!(BackendError::Http(String::new()).kind(), "network");
    }

    #[test]
    fn test_split_into_chunks() {
        let chunks = split_into_chunks("hello  streaming world");
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1].token, "streaming");
        assert_eq!(chunks[1].index, 1);
        assert!(chunks[3].is_final);
        assert!(chunks[3].token.is_empty());

        let empty = split_into_chunks("");
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_final);
    }
}
