//! LLM client trait and provider implementations.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, ModelCallKind, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, Provider, StopReason, TokenUsage,
};

/// Model-client capability consumed by generators, the backward engine and
/// the text optimizer.
///
/// Transport and auth failures come back as [`Error::ModelCall`]; a model that
/// declines to answer returns `Ok` with [`StopReason::Refusal`].
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for HTTP LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
        }
    }

    /// Read the API key from the given environment variable.
    pub fn from_env(key_var: &str) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| Error::Config(format!("environment variable {key_var} is not set")))?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}"))),
    }
}

/// Map a non-success HTTP status to a model call failure class.
fn classify_status(status: StatusCode) -> ModelCallKind {
    match status.as_u16() {
        401 | 403 => ModelCallKind::Auth,
        408 | 429 => ModelCallKind::RateLimited,
        s if s >= 500 => ModelCallKind::Server,
        _ => ModelCallKind::InvalidResponse,
    }
}

async fn send_json<T: Serialize>(
    provider: Provider,
    request: reqwest::RequestBuilder,
    body: &T,
) -> Result<String> {
    let response = request
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| {
            Error::model_call(
                provider.to_string(),
                ModelCallKind::Transport,
                format!("HTTP request failed: {e}"),
            )
        })?;

    let status = response.status();
    let text = response.text().await.map_err(|e| {
        Error::model_call(
            provider.to_string(),
            ModelCallKind::Transport,
            format!("Failed to read response: {e}"),
        )
    })?;

    if !status.is_success() {
        return Err(Error::model_call(
            provider.to_string(),
            classify_status(status),
            format!("{status}: {}", provider_error_message(&text)),
        ));
    }

    Ok(text)
}

/// Pull `error.message` out of a provider error body, falling back to the body.
fn provider_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Anthropic Claude client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MODEL: &'static str = "claude-3-5-sonnet-20241022";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;

        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        // Anthropic takes system content out of band.
        let mut system_parts: Vec<String> = request.system.into_iter().collect();
        let mut messages = Vec::with_capacity(request.messages.len());
        for m in request.messages {
            match m.role {
                ChatRole::System => system_parts.push(m.content),
                ChatRole::User => messages.push(ApiMessage {
                    role: "user".to_string(),
                    content: m.content,
                }),
                ChatRole::Assistant => messages.push(ApiMessage {
                    role: "assistant".to_string(),
                    content: m.content,
                }),
            }
        }

        let api_request = AnthropicRequest {
            model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            temperature: request.temperature,
            stop_sequences: request.stop,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let http_request = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION);
        let body = send_json(Provider::Anthropic, http_request, &api_request).await?;

        let api_response: AnthropicResponse = serde_json::from_str(&body).map_err(|e| {
            Error::model_call(
                "anthropic",
                ModelCallKind::InvalidResponse,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            "refusal" => StopReason::Refusal,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
            timestamp: Utc::now(),
            raw_response: Some(body),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenAI client.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";
    const DEFAULT_MODEL: &'static str = "gpt-4o";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;

        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        let mut messages: Vec<ApiMessage> = Vec::new();

        if let Some(system) = request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system,
            });
        }

        for m in request.messages {
            messages.push(ApiMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                    ChatRole::System => "system".to_string(),
                },
                content: m.content,
            });
        }

        let api_request = OpenAIRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let http_request = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key));
        let body = send_json(Provider::OpenAI, http_request, &api_request).await?;

        let api_response: OpenAIResponse = serde_json::from_str(&body).map_err(|e| {
            Error::model_call(
                "openai",
                ModelCallKind::InvalidResponse,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| {
            Error::model_call("openai", ModelCallKind::InvalidResponse, "No choices in response")
        })?;

        let refused = choice.message.refusal.is_some();
        let stop_reason = match choice.finish_reason.as_deref() {
            _ if refused => Some(StopReason::Refusal),
            Some("length") => Some(StopReason::MaxTokens),
            Some("tool_calls") => Some(StopReason::ToolUse),
            Some("content_filter") => Some(StopReason::Refusal),
            Some(_) => Some(StopReason::EndTurn),
            None => None,
        };

        let content = choice
            .message
            .content
            .or(choice.message.refusal)
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.prompt_tokens,
                output_tokens: api_response.usage.completion_tokens,
            },
            timestamp: Utc::now(),
            raw_response: Some(body),
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("test-key")
            .with_base_url("https://custom.api.com")
            .with_default_model("claude-3-5-haiku")
            .with_timeout(60);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, Some("https://custom.api.com".to_string()));
        assert_eq!(config.default_model, Some("claude-3-5-haiku".to_string()));
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_client_config_from_missing_env() {
        let err = ClientConfig::from_env("ADAL_TEST_KEY_THAT_IS_NEVER_SET").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ModelCallKind::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ModelCallKind::Auth);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ModelCallKind::RateLimited);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ModelCallKind::Server);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ModelCallKind::InvalidResponse);
    }

    #[test]
    fn test_provider_error_message() {
        let body = r#"{"error": {"type": "authentication_error", "message": "invalid x-api-key"}}"#;
        assert_eq!(provider_error_message(body), "invalid x-api-key");
        assert_eq!(provider_error_message("gateway down"), "gateway down");
    }

    #[test]
    fn test_clients_report_provider() {
        let anthropic = AnthropicClient::new(ClientConfig::new("test")).unwrap();
        let openai = OpenAIClient::new(ClientConfig::new("test")).unwrap();
        assert_eq!(anthropic.provider(), Provider::Anthropic);
        assert_eq!(openai.provider(), Provider::OpenAI);
    }
}
