//! Textual loss: an eval score plus feedback on the prediction.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::error::Result;
use crate::eval::EvalFn;
use crate::graph::{
    value_text, BackwardEngine, BackwardFn, Feedback, FeedbackRequest, Graph, ParamId, Parameter,
};

/// Adds a loss node over a prediction and its ground truth.
///
/// The loss node is the root of the backward pass.
pub trait LossFn: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, graph: &mut Graph, y: ParamId, y_gt: ParamId) -> Result<ParamId>;
}

/// Loss built from an [`EvalFn`].
///
/// The node's data is the eval score of `y.eval_input` against
/// `y_gt.eval_input`, or zero when `y` records a failed generation. Its
/// backward step asks the backward engine why the prediction missed; a
/// perfect score gets fixed feedback without a model call.
pub struct TextLoss {
    eval_fn: Arc<dyn EvalFn>,
    description: String,
}

impl TextLoss {
    pub fn new(eval_fn: Arc<dyn EvalFn>) -> Self {
        let description = format!("{} between the predicted and the expected answer", eval_fn.name());
        Self { eval_fn, description }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl LossFn for TextLoss {
    fn name(&self) -> &str {
        self.eval_fn.name()
    }

    fn forward(&self, graph: &mut Graph, y: ParamId, y_gt: ParamId) -> Result<ParamId> {
        let pred = graph.get(y)?;
        let failed = pred.full_response().map_or(false, |r| r.is_error());
        let predicted = value_text(pred.eval_input());
        let ground_truth = value_text(graph.get(y_gt)?.eval_input());
        let score = if failed {
            0.0
        } else {
            self.eval_fn.score(&predicted, &ground_truth)
        };

        let name = graph.unique_name("loss");
        graph.add(
            Parameter::output(name, json!(score))
                .with_role_desc(self.description.clone())
                .with_predecessors(vec![y, y_gt])
                .with_grad_fn(Arc::new(LossBackward {
                    y,
                    score,
                    predicted,
                    ground_truth,
                })),
        )
    }
}

struct LossBackward {
    y: ParamId,
    score: f64,
    predicted: String,
    ground_truth: String,
}

#[async_trait]
impl BackwardFn for LossBackward {
    async fn backward(
        &self,
        engine: &BackwardEngine,
        graph: &Graph,
        output: ParamId,
    ) -> Result<Vec<(ParamId, Feedback)>> {
        let loss = graph.get(output)?;
        if self.score >= 1.0 {
            let feedback = Feedback::new(&loss.name, "The prediction matches the ground truth.")
                .with_score(Some(self.score));
            return Ok(vec![(self.y, feedback)]);
        }

        let context = format!(
            "score: {}\npredicted answer: {}\nexpected answer: {}",
            self.score, self.predicted, self.ground_truth
        );
        let text = engine
            .feedback(FeedbackRequest {
                target: graph.get(self.y)?,
                output: loss,
                context: Some(context),
            })
            .await?;
        Ok(vec![(self.y, Feedback::new(&loss.name, text).with_score(Some(self.score)))])
    }
}
