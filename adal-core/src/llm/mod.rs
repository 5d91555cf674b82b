//! Model-client abstraction.
//!
//! Every model role in a training run (the task's generator, the teacher, the
//! backward engine and the text optimizer) talks to a model through the
//! [`LLMClient`] trait, paired with per-role [`ModelKwargs`] in a
//! [`ModelConfig`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use adal_core::llm::{AnthropicClient, ClientConfig, ModelConfig, ModelKwargs};
//!
//! let client = AnthropicClient::new(ClientConfig::from_env("ANTHROPIC_API_KEY")?)?;
//! let generator_model = ModelConfig::new(
//!     Arc::new(client),
//!     ModelKwargs::new().with_model("claude-3-5-haiku-20241022").with_temperature(0.0),
//! );
//! ```

mod client;
mod retry;
mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient, OpenAIClient};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, ModelConfig, ModelKwargs,
    Provider, StopReason, TokenUsage,
};
