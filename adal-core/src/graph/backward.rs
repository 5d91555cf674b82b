//! Textual backward pass over the parameter graph.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

use super::arena::Graph;
use super::parameter::{value_text, Feedback, ParamId, Parameter};
use crate::error::{Error, ModelCallKind, Result};
use crate::llm::{ChatMessage, ModelConfig, RetryPolicy};
use crate::parser::truncate;

const ENGINE_SYSTEM_PROMPT: &str = "You are the feedback engine of an optimization system \
that improves the variables of an LLM pipeline. Given a variable, the output it helped \
produce and the feedback on that output, explain concisely how the variable should change \
to improve the output. Do not propose a rewritten variable. If the variable needs no change, \
say so.";

/// Backward step of the component that produced a node.
///
/// Given the output node, returns feedback for some of its predecessors.
#[async_trait]
pub trait BackwardFn: Send + Sync {
    async fn backward(
        &self,
        engine: &BackwardEngine,
        graph: &Graph,
        output: ParamId,
    ) -> Result<Vec<(ParamId, Feedback)>>;
}

/// One feedback question put to the backward engine.
#[derive(Debug)]
pub struct FeedbackRequest<'a> {
    /// Parameter that should receive the feedback.
    pub target: &'a Parameter,
    /// Output the target contributed to.
    pub output: &'a Parameter,
    /// Extra facts about the sample (ground truth, score, inputs).
    pub context: Option<String>,
}

/// Model role that turns downstream feedback into feedback for one predecessor.
#[derive(Debug, Clone)]
pub struct BackwardEngine {
    model: ModelConfig,
    retry: RetryPolicy,
}

impl BackwardEngine {
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

    /// Ask the engine how `request.target` should change.
    pub async fn feedback(&self, request: FeedbackRequest<'_>) -> Result<String> {
        let prompt = render_request(&request);
        let model_request = self.model.request(vec![
            ChatMessage::system(ENGINE_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ]);

        let response = self
            .retry
            .run("backward engine", || self.model.client.complete(model_request.clone()))
            .await?;
        if response.is_declined() {
            return Err(Error::model_call(
                self.model.client.provider().to_string(),
                ModelCallKind::InvalidResponse,
                "backward engine declined the request",
            ));
        }

        debug!(
            target_param = %request.target.name,
            "backward engine feedback: {}",
            truncate(&response.content, 120)
        );
        Ok(response.content.trim().to_string())
    }
}

fn render_request(request: &FeedbackRequest<'_>) -> String {
    let downstream: Vec<&str> = request
        .output
        .feedback()
        .iter()
        .map(|f| f.text.as_str())
        .collect();

    let mut prompt = format!(
        "<VARIABLE role=\"{}\">\n{}\n</VARIABLE>\n\n<OUTPUT role=\"{}\">\n{}\n</OUTPUT>\n",
        request.target.role_desc,
        request.target.data_text(),
        request.output.role_desc,
        value_text(request.output.data()),
    );
    if !downstream.is_empty() {
        prompt.push_str(&format!(
            "\n<OUTPUT_FEEDBACK>\n{}\n</OUTPUT_FEEDBACK>\n",
            downstream.join("\n")
        ));
    }
    if let Some(context) = &request.context {
        prompt.push_str(&format!("\n<CONTEXT>\n{}\n</CONTEXT>\n", context));
    }
    prompt
}

impl Graph {
    /// Propagate textual feedback from `root` to every optimizable ancestor.
    ///
    /// Nodes are processed in descending handle order, so each node's backward
    /// step runs after all of its successors delivered their feedback. Each
    /// reachable node is processed once. Returns the number of nodes visited.
    pub async fn backward(&mut self, root: ParamId, engine: &BackwardEngine) -> Result<usize> {
        let order = self.reachable_from(root)?;
        let reachable: HashSet<ParamId> = order.iter().copied().collect();

        for &id in &order {
            let Some(grad_fn) = self.get(id)?.grad_fn() else {
                continue;
            };
            let updates = grad_fn.backward(engine, self, id).await?;
            for (target, feedback) in updates {
                if reachable.contains(&target) {
                    self.add_feedback(target, feedback)?;
                }
            }
        }
        Ok(order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelKwargs;
    use crate::testing::ScriptedClient;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Sends fixed feedback to every predecessor and counts its invocations.
    struct Broadcast {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackwardFn for Broadcast {
        async fn backward(
            &self,
            _engine: &BackwardEngine,
            graph: &Graph,
            output: ParamId,
        ) -> Result<Vec<(ParamId, Feedback)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let node = graph.get(output)?;
            Ok(node
                .predecessors()
                .iter()
                .map(|&p| (p, Feedback::new(&node.name, format!("from {}", node.name))))
                .collect())
        }
    }

    fn engine(client: Arc<ScriptedClient>) -> BackwardEngine {
        BackwardEngine::new(ModelConfig::new(client, ModelKwargs::new()))
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_backward_reaches_shared_ancestor_once_per_path() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = Graph::new();
        let prompt = graph
            .attach(&Parameter::prompt("instruction", "x", "task instruction"))
            .unwrap();
        let gt = graph.add(Parameter::ground_truth("y_gt", "yes")).unwrap();
        let left = graph
            .add(
                Parameter::output("left", json!("l"))
                    .with_predecessors(vec![prompt])
                    .with_grad_fn(Arc::new(Broadcast { calls: calls.clone() })),
            )
            .unwrap();
        let right = graph
            .add(
                Parameter::output("right", json!("r"))
                    .with_predecessors(vec![prompt])
                    .with_grad_fn(Arc::new(Broadcast { calls: calls.clone() })),
            )
            .unwrap();
        let loss = graph
            .add(
                Parameter::output("loss", json!(0.0))
                    .with_predecessors(vec![left, right, gt])
                    .with_grad_fn(Arc::new(Broadcast { calls: calls.clone() })),
            )
            .unwrap();

        let visited = graph
            .backward(loss, &engine(Arc::new(ScriptedClient::replying("unused"))))
            .await
            .unwrap();

        assert_eq!(visited, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(graph.get(prompt).unwrap().feedback().len(), 2);
        assert!(graph.get(gt).unwrap().feedback().is_empty());
    }

    #[tokio::test]
    async fn test_engine_prompt_includes_downstream_feedback() {
        let client = Arc::new(ScriptedClient::replying("  Mention nationality.  "));
        let engine = engine(client.clone());

        let target = Parameter::prompt("instruction", "Answer.", "task instruction");
        let mut output = Parameter::output("gen_output", json!({"answer": "no"}))
            .with_role_desc("generator answer");
        output.push_feedback(Feedback::new("loss", "expected yes"));

        let text = engine
            .feedback(FeedbackRequest {
                target: &target,
                output: &output,
                context: Some("score: 0".into()),
            })
            .await
            .unwrap();

        assert_eq!(text, "Mention nationality.");
        let prompt = client.requests()[0].prompt_text();
        assert!(prompt.contains("<VARIABLE role=\"task instruction\">\nAnswer.\n</VARIABLE>"));
        assert!(prompt.contains("expected yes"));
        assert!(prompt.contains("score: 0"));
    }

    #[tokio::test]
    async fn test_engine_refusal_is_model_error() {
        let engine = engine(Arc::new(ScriptedClient::declining()));
        let target = Parameter::prompt("instruction", "Answer.", "task instruction");
        let output = Parameter::output("gen_output", json!("x"));
        let err = engine
            .feedback(FeedbackRequest {
                target: &target,
                output: &output,
                context: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_sample_level());
    }
}
