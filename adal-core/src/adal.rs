//! Binding between a task pipeline and the trainer.
//!
//! An [`AdalComponent`] tells the trainer, for each dataset sample, how to
//! invoke the task ([`AdalComponent::prepare_task`]), how to score an
//! inference output ([`AdalComponent::prepare_eval`]) and how to attach a
//! loss to a training output ([`AdalComponent::prepare_loss`]). It also
//! carries the auxiliary model roles used during training.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::component::{answer_or_empty, Dispatched, GeneratorOutput, GradComponent, Mode, Run};
use crate::error::{Error, Result};
use crate::eval::EvalFn;
use crate::graph::{Graph, ParamId};
use crate::llm::{ModelConfig, RetryPolicy};
use crate::loss::LossFn;

/// A dataset record with a stable identifier.
pub trait Sample: Clone + Send + Sync + Serialize {
    /// Tracing handle for reports and logs; never drives control flow.
    fn id(&self) -> &str;
}

/// Auxiliary model roles used by [`Trainer::fit`](crate::trainer::Trainer::fit).
#[derive(Debug, Clone, Default)]
pub struct ModelRoles {
    /// Produces feedback during the backward pass. Required for training.
    pub backward_engine: Option<ModelConfig>,
    /// Replaces the task's generator models while training, so bootstrapped
    /// demonstrations come from the teacher.
    pub teacher: Option<ModelConfig>,
    /// Rewrites prompt parameters. Without it only demonstrations are trained.
    pub text_optimizer: Option<ModelConfig>,
    /// Retry limit of the backward engine and text optimizer calls.
    pub retry: RetryPolicy,
}

impl ModelRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backward_engine(mut self, model: ModelConfig) -> Self {
        self.backward_engine = Some(model);
        self
    }

    pub fn with_teacher(mut self, model: ModelConfig) -> Self {
        self.teacher = Some(model);
        self
    }

    pub fn with_text_optimizer(mut self, model: ModelConfig) -> Self {
        self.text_optimizer = Some(model);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Which body of the task a [`TaskCall`] invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Call,
    Forward,
}

impl From<Mode> for Entry {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Inference => Self::Call,
            Mode::Training => Self::Forward,
        }
    }
}

/// A prepared task invocation.
#[derive(Debug, Clone)]
pub struct TaskCall<I> {
    pub entry: Entry,
    pub input: I,
}

impl<I: Send + Sync> TaskCall<I> {
    pub async fn invoke<T>(self, task: &T, run: &mut Run) -> Result<Dispatched<T::Output>>
    where
        T: GradComponent<Input = I>,
    {
        match self.entry {
            Entry::Call => task.call(run, self.input).await.map(Dispatched::Value),
            Entry::Forward => task.forward(run, self.input).await.map(Dispatched::Param),
        }
    }
}

/// A prepared evaluation.
#[derive(Clone)]
pub struct EvalCall {
    pub eval_fn: Arc<dyn EvalFn>,
    pub y: String,
    pub y_gt: String,
}

impl EvalCall {
    pub fn score(&self) -> f64 {
        self.eval_fn.score(&self.y, &self.y_gt)
    }
}

/// A prepared loss over two nodes of a training graph.
#[derive(Clone)]
pub struct LossCall {
    pub loss_fn: Arc<dyn LossFn>,
    pub y: ParamId,
    pub y_gt: ParamId,
}

impl LossCall {
    pub fn forward(&self, graph: &mut Graph) -> Result<ParamId> {
        self.loss_fn.forward(graph, self.y, self.y_gt)
    }
}

/// Set a generator output node's eval input to its parsed answer, using the
/// missing-answer-maps-to-empty policy of [`answer_or_empty`].
pub fn derive_answer_eval_input(graph: &mut Graph, pred: ParamId) -> Result<()> {
    graph
        .get_mut(pred)?
        .derive_eval_input(|p| Value::String(answer_or_empty(p.full_response())));
    Ok(())
}

/// Task pipeline plus everything the trainer needs to evaluate and train it.
#[async_trait]
pub trait AdalComponent: Send + Sync {
    type Sample: Sample;
    type Task: GradComponent<Output = GeneratorOutput>;

    fn task(&self) -> &Self::Task;

    fn roles(&self) -> &ModelRoles;

    fn eval_fn(&self) -> Arc<dyn EvalFn>;

    fn loss_fn(&self) -> Arc<dyn LossFn>;

    /// Expected answer of a sample, as reported next to each prediction.
    fn ground_truth(&self, sample: &Self::Sample) -> String;

    /// Task invocation for `sample`: `call` in inference, `forward` in training.
    fn prepare_task(
        &self,
        sample: &Self::Sample,
        mode: Mode,
    ) -> TaskCall<<Self::Task as GradComponent>::Input>;

    /// Evaluation of an inference output. Never fails: a missing prediction
    /// scores as the empty answer.
    fn prepare_eval(&self, sample: &Self::Sample, y_pred: Option<&GeneratorOutput>) -> EvalCall {
        EvalCall {
            eval_fn: self.eval_fn(),
            y: answer_or_empty(y_pred),
            y_gt: self.ground_truth(sample),
        }
    }

    /// Loss over the training output `pred`. Adds a fixed ground-truth node
    /// and refreshes `pred`'s eval input from its full response.
    fn prepare_loss(&self, sample: &Self::Sample, graph: &mut Graph, pred: ParamId) -> Result<LossCall> {
        let name = graph.unique_name(&format!("y_gt_{}", sample.id()));
        let y_gt = graph.add(
            crate::graph::Parameter::ground_truth(name, self.ground_truth(sample))
                .with_role_desc("The ground truth answer"),
        )?;
        derive_answer_eval_input(graph, pred)?;
        Ok(LossCall {
            loss_fn: self.loss_fn(),
            y: pred,
            y_gt,
        })
    }

    /// Fail with [`Error::Config`] when a collaborator needed for `mode` is
    /// missing.
    async fn check_config(&self, mode: Mode) -> Result<()> {
        self.task().validate().await?;
        if mode.is_training() && self.roles().backward_engine.is_none() {
            return Err(Error::Config(
                "training requires a backward engine model".to_string(),
            ));
        }
        Ok(())
    }
}
