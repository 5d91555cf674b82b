use std::sync::Arc;

use super::{HotPotQAData, RagQuery, RagTask};
use crate::adal::{AdalComponent, Entry, ModelRoles, TaskCall};
use crate::component::Mode;
use crate::eval::{EvalFn, ExactMatch};
use crate::loss::{LossFn, TextLoss};

/// Trainer binding for [`RagTask`] over [`HotPotQAData`].
///
/// Scores with exact match by default; the loss is a [`TextLoss`] over the
/// same eval fn.
pub struct RagAdal {
    task: RagTask,
    roles: ModelRoles,
    eval_fn: Arc<dyn EvalFn>,
    loss_fn: Arc<dyn LossFn>,
}

impl RagAdal {
    pub fn new(task: RagTask, roles: ModelRoles) -> Self {
        let eval_fn: Arc<dyn EvalFn> = Arc::new(ExactMatch);
        Self {
            task,
            roles,
            loss_fn: Arc::new(TextLoss::new(eval_fn.clone())),
            eval_fn,
        }
    }

    /// Use `eval_fn` for evaluation and as the loss score.
    pub fn with_eval_fn(mut self, eval_fn: Arc<dyn EvalFn>) -> Self {
        self.loss_fn = Arc::new(TextLoss::new(eval_fn.clone()));
        self.eval_fn = eval_fn;
        self
    }
}

impl AdalComponent for RagAdal {
    type Sample = HotPotQAData;
    type Task = RagTask;

    fn task(&self) -> &RagTask {
        &self.task
    }

    fn roles(&self) -> &ModelRoles {
        &self.roles
    }

    fn eval_fn(&self) -> Arc<dyn EvalFn> {
        self.eval_fn.clone()
    }

    fn loss_fn(&self) -> Arc<dyn LossFn> {
        self.loss_fn.clone()
    }

    fn ground_truth(&self, sample: &HotPotQAData) -> String {
        sample.answer.clone()
    }

    fn prepare_task(&self, sample: &HotPotQAData, mode: Mode) -> TaskCall<RagQuery> {
        TaskCall {
            entry: Entry::from(mode),
            input: RagQuery::new(sample.question.clone()).with_id(sample.id.clone()),
        }
    }
}
