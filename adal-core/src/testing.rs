//! Scripted collaborators shared by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use std::time::Duration;

use crate::component::{RetrievedDocument, RetrieverBackend};
use crate::error::{Error, ModelCallKind, Result};
use crate::llm::{CompletionRequest, CompletionResponse, LLMClient, Provider, StopReason, TokenUsage};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync>;

/// Model client answering from a closure and recording every request.
pub(crate) struct ScriptedClient {
    respond: Responder,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always replies with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(Self::response(text.clone())))
    }

    /// Replies with text computed from the request.
    pub fn responding<F>(reply: F) -> Self
    where
        F: Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    {
        Self::new(move |request| Ok(Self::response(reply(request))))
    }

    /// Refuses every request.
    pub fn declining() -> Self {
        Self::new(|_| {
            let mut response = Self::response("I can't help with that.");
            response.stop_reason = Some(StopReason::Refusal);
            Ok(response)
        })
    }

    /// Fails every request with a model call error of `kind`.
    pub fn failing(kind: ModelCallKind) -> Self {
        Self::new(move |_| Err(Error::model_call("scripted", kind, "scripted failure")))
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn response(content: impl Into<String>) -> CompletionResponse {
        CompletionResponse {
            id: "test".to_string(),
            model: "test-model".to_string(),
            content: content.into(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            timestamp: Utc::now(),
            raw_response: None,
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(&request)
    }

    fn provider(&self) -> Provider {
        Provider::Local
    }
}

type Failure = Box<dyn Fn() -> Error + Send + Sync>;

/// Retrieval backend returning a fixed list, or failing.
pub(crate) struct StaticRetriever {
    documents: Vec<String>,
    failure: Option<Failure>,
}

impl StaticRetriever {
    pub fn new<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: documents.into_iter().map(Into::into).collect(),
            failure: None,
        }
    }

    pub fn failing() -> Self {
        Self::failing_with(|| Error::Retrieval("index unavailable".to_string()))
    }

    /// Fails every lookup with the error `failure` builds.
    pub fn failing_with<F>(failure: F) -> Self
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        Self {
            documents: Vec::new(),
            failure: Some(Box::new(failure)),
        }
    }
}

#[async_trait]
impl RetrieverBackend for StaticRetriever {
    async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<RetrievedDocument>> {
        if let Some(failure) = &self.failure {
            return Err(failure());
        }
        Ok(self
            .documents
            .iter()
            .take(k)
            .map(RetrievedDocument::new)
            .collect())
    }
}
