//! # switchyard-core
//!
//! Backend-independent request and response model for switchyard.
//!
//! This crate is synchronous and free of I/O. It defines:
//! - Role-tagged chat messages and per-call options
//! - The response shape every backend produces
//! - Token counting approximations and per-model pricing tables
//!
//! ## Example
//!
//! ```rust
//! use switchyard_core::{ChatMessage, CompletionOptions, CompletionRequest};
//!
//! let request = CompletionRequest::new(vec![
//!     ChatMessage::system("Answer in one sentence."),
//!     ChatMessage::user("What is a circuit breaker?"),
//! ])
//! .with_options(CompletionOptions::default().with_temperature(0.2));
//!
//! assert!(request.validate().is_ok());
//! ```

pub mod tokens;
pub mod types;

pub use tokens::{ModelPricing, PricingTable, TokenCounter, TokenizerKind};
pub use types::{
    ChatMessage, CompletionOptions, CompletionRequest, CompletionResponse, OptionsError, Role,
    TokenUsage, ToolSchema, MAX_TEMPERATURE,
};
