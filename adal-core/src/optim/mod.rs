//! Optimizers that rewrite optimizable parameters from textual feedback.
//!
//! The trainer merges the feedback every sample of a step left on a shared
//! parameter and asks each [`Optimizer`] that accepts the parameter for a
//! proposal. Proposals are applied by the trainer alone, then kept or
//! reverted depending on the validation score.

mod demos;
mod text;

pub use demos::{DemoOptimizer, Demonstration};
pub use text::TextOptimizer;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::{Feedback, Parameter};

#[async_trait]
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this optimizer handles `param`. Never true for fixed parameters.
    fn accepts(&self, param: &Parameter) -> bool;

    /// New data for `param`, or `None` to keep the current value.
    async fn propose(&self, param: &Parameter, feedback: &[Feedback]) -> Result<Option<Value>>;
}
