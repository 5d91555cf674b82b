//! Prompt rewriting through the text-optimizer model.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::Optimizer;
use crate::error::{Error, Result};
use crate::graph::{Feedback, ParamType, Parameter};
use crate::llm::{ChatMessage, ModelConfig, RetryPolicy};
use crate::parser::{truncate, ParseError};

const OPEN_TAG: &str = "<IMPROVED_VARIABLE>";
const CLOSE_TAG: &str = "</IMPROVED_VARIABLE>";

const OPTIMIZER_SYSTEM_PROMPT: &str = "You improve one variable of an LLM pipeline. \
You receive the variable, its role and feedback collected while the pipeline answered \
training samples. Rewrite the variable so that it addresses the feedback while keeping \
its role. Return only the new value, wrapped in <IMPROVED_VARIABLE> and \
</IMPROVED_VARIABLE> tags.";

/// Rewrites prompt parameters from merged feedback.
#[derive(Debug, Clone)]
pub struct TextOptimizer {
    model: ModelConfig,
    retry: RetryPolicy,
}

impl TextOptimizer {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn render(param: &Parameter, feedback: &[&Feedback]) -> String {
        let mut prompt = format!(
            "<VARIABLE role=\"{}\">\n{}\n</VARIABLE>\n\n<FEEDBACK>\n",
            param.role_desc,
            param.data_text()
        );
        for fb in feedback {
            match fb.score {
                Some(score) => prompt.push_str(&format!("- (score {:.2}) {}\n", score, fb.text)),
                None => prompt.push_str(&format!("- {}\n", fb.text)),
            }
        }
        prompt.push_str("</FEEDBACK>\n");
        prompt
    }
}

/// Text between the improved-variable tags.
fn extract_improved(response: &str) -> std::result::Result<String, ParseError> {
    let start = response
        .find(OPEN_TAG)
        .ok_or_else(|| ParseError::MissingField("IMPROVED_VARIABLE".to_string()))?
        + OPEN_TAG.len();
    let end = response[start..]
        .find(CLOSE_TAG)
        .ok_or_else(|| ParseError::MissingField("IMPROVED_VARIABLE".to_string()))?;
    let improved = response[start..start + end].trim();
    if improved.is_empty() {
        return Err(ParseError::EmptyResponse);
    }
    Ok(improved.to_string())
}

#[async_trait]
impl Optimizer for TextOptimizer {
    fn name(&self) -> &str {
        "text_optimizer"
    }

    fn accepts(&self, param: &Parameter) -> bool {
        param.requires_opt && param.param_type == ParamType::Prompt
    }

    async fn propose(&self, param: &Parameter, feedback: &[Feedback]) -> Result<Option<Value>> {
        let actionable: Vec<&Feedback> = feedback
            .iter()
            .filter(|f| f.score.map_or(true, |s| s < 1.0))
            .collect();
        if actionable.is_empty() {
            return Ok(None);
        }

        let request = self.model.request(vec![
            ChatMessage::system(OPTIMIZER_SYSTEM_PROMPT),
            ChatMessage::user(Self::render(param, &actionable)),
        ]);
        let response = self
            .retry
            .run("text optimizer", || self.model.client.complete(request.clone()))
            .await?;
        if response.is_declined() {
            warn!(param = %param.name, "text optimizer declined to propose");
            return Ok(None);
        }

        let improved = extract_improved(&response.content).map_err(Error::Parse)?;
        if improved == param.data_text() {
            return Ok(None);
        }
        debug!(param = %param.name, "proposed: {}", truncate(&improved, 120));
        Ok(Some(Value::String(improved)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelKwargs;
    use crate::testing::ScriptedClient;
    use std::sync::Arc;

    fn optimizer(client: Arc<ScriptedClient>) -> TextOptimizer {
        TextOptimizer::new(ModelConfig::new(client, ModelKwargs::new())).with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_proposes_tagged_rewrite() {
        let client = Arc::new(ScriptedClient::replying(
            "Sure.\n<IMPROVED_VARIABLE>\nAnswer yes or no.\n</IMPROVED_VARIABLE>",
        ));
        let param = Parameter::prompt("instruction", "Answer.", "task instruction");
        let feedback = vec![
            Feedback::new("gen_output", "Be explicit about yes/no.").with_score(Some(0.0)),
            Feedback::new("gen_output", "Fine.").with_score(Some(1.0)),
        ];

        let proposal = optimizer(client.clone()).propose(&param, &feedback).await.unwrap();
        assert_eq!(proposal, Some(Value::String("Answer yes or no.".into())));

        let prompt = client.requests()[0].prompt_text();
        assert!(prompt.contains("(score 0.00) Be explicit about yes/no."));
        assert!(!prompt.contains("Fine."));
    }

    #[tokio::test]
    async fn test_perfect_feedback_needs_no_call() {
        let client = Arc::new(ScriptedClient::replying("unused"));
        let param = Parameter::prompt("instruction", "Answer.", "task instruction");
        let feedback = vec![Feedback::new("gen_output", "ok").with_score(Some(1.0))];
        assert!(optimizer(client.clone()).propose(&param, &feedback).await.unwrap().is_none());
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_untagged_response_is_parse_error() {
        let client = Arc::new(ScriptedClient::replying("Answer yes or no."));
        let param = Parameter::prompt("instruction", "Answer.", "task instruction");
        let err = optimizer(client)
            .propose(&param, &[Feedback::new("gen_output", "vague")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::MissingField(_))));
    }

    #[test]
    fn test_extract_improved() {
        assert_eq!(extract_improved("<IMPROVED_VARIABLE> x </IMPROVED_VARIABLE>").unwrap(), "x");
        assert_eq!(
            extract_improved("<IMPROVED_VARIABLE></IMPROVED_VARIABLE>").unwrap_err(),
            ParseError::EmptyResponse
        );
    }

    #[test]
    fn test_accepts_only_optimizable_prompts() {
        let client = Arc::new(ScriptedClient::replying("unused"));
        let opt = optimizer(client);
        assert!(opt.accepts(&Parameter::prompt("p", "x", "instruction")));
        assert!(!opt.accepts(&Parameter::prompt("p", "x", "instruction").with_requires_opt(false)));
        assert!(!opt.accepts(&Parameter::demos("d", "examples")));
    }
}
