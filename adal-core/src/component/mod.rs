//! Dual-mode pipeline components.
//!
//! Every component exposes two bodies for the same computation:
//!
//! - [`GradComponent::call`] runs eagerly and returns the concrete output.
//! - [`GradComponent::forward`] records the computation in the run's
//!   [`Graph`] and returns the handle of the output [`Parameter`](crate::graph::Parameter).
//!
//! Which body runs is decided by the [`Mode`] carried by the [`Run`] passed to
//! every invocation; there is no mode flag on the component itself, so one
//! component can serve concurrent inference and training runs. Call sites use
//! [`GradComponent::dispatch`], which matches on the mode. Invoking a body
//! under the other mode fails with [`Error::InvalidMode`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use adal_core::component::{Dispatched, GradComponent, Run};
//!
//! let mut run = Run::inference();
//! match task.dispatch(&mut run, query).await? {
//!     Dispatched::Value(output) => println!("{:?}", output.answer()),
//!     Dispatched::Param(_) => unreachable!("inference runs return values"),
//! }
//! ```

mod generator;
mod retriever;

pub use generator::{answer_or_empty, Generator, GeneratorOutput};
pub use retriever::{
    InMemoryBackend, RetrievedDocument, Retriever, RetrieverBackend, RetrieverOutput,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::{Graph, ParamId, SharedParameter};
use crate::llm::ModelConfig;

/// Execution mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Eager execution returning concrete outputs.
    Inference,
    /// Graph-building execution returning parameter handles.
    Training,
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inference => write!(f, "inference"),
            Self::Training => write!(f, "training"),
        }
    }
}

/// Unique identity of a component instance, used to key successor map fns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId(Uuid);

impl ComponentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of one pipeline run: its mode and, in training mode, its graph.
#[derive(Debug)]
pub struct Run {
    mode: Mode,
    trace_id: Uuid,
    graph: Graph,
}

impl Run {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            trace_id: Uuid::new_v4(),
            graph: Graph::new(),
        }
    }

    pub fn inference() -> Self {
        Self::new(Mode::Inference)
    }

    pub fn training() -> Self {
        Self::new(Mode::Training)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Identifier attached to log lines of this run.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Fail with [`Error::InvalidMode`] unless the run is in `expected` mode.
    pub fn expect_mode(&self, expected: Mode, component: &str) -> Result<()> {
        if self.mode != expected {
            return Err(Error::invalid_mode(component, expected, self.mode));
        }
        Ok(())
    }
}

/// A prompt argument: a literal value, or a node of the run's graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    Param(ParamId),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<ParamId> for Arg {
    fn from(id: ParamId) -> Self {
        Self::Param(id)
    }
}

/// Named prompt arguments, rendered in key order.
pub type PromptKwargs = BTreeMap<String, Arg>;

/// Result of [`GradComponent::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched<T> {
    /// Concrete output of an inference run.
    Value(T),
    /// Output node of a training run.
    Param(ParamId),
}

impl<T> Dispatched<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Param(_) => None,
        }
    }

    pub fn param(&self) -> Option<ParamId> {
        match self {
            Self::Value(_) => None,
            Self::Param(id) => Some(*id),
        }
    }
}

/// A component that runs eagerly or records itself into the run's graph.
///
/// `call` and the value carried by the node `forward` returns must agree:
/// both paths produce the same answer for the same inputs.
#[async_trait]
pub trait GradComponent: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn id(&self) -> ComponentId;

    fn name(&self) -> &str;

    /// Inference body. Fails with [`Error::InvalidMode`] in a training run.
    async fn call(&self, run: &Run, input: Self::Input) -> Result<Self::Output>;

    /// Training body. Fails with [`Error::InvalidMode`] in an inference run.
    async fn forward(&self, run: &mut Run, input: Self::Input) -> Result<ParamId>;

    /// Run the body that matches the run's mode.
    async fn dispatch(&self, run: &mut Run, input: Self::Input) -> Result<Dispatched<Self::Output>> {
        match run.mode() {
            Mode::Inference => self.call(run, input).await.map(Dispatched::Value),
            Mode::Training => self.forward(run, input).await.map(Dispatched::Param),
        }
    }

    /// Pipeline-owned parameters of this component and its sub-components.
    fn parameters(&self) -> Vec<SharedParameter> {
        Vec::new()
    }

    /// Install or remove a teacher model on every generator in the component.
    async fn set_teacher(&self, _teacher: Option<ModelConfig>) {}

    /// Check that every required collaborator is configured.
    async fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_mode() {
        let run = Run::training();
        assert!(run.expect_mode(Mode::Training, "gen").is_ok());
        let err = run.expect_mode(Mode::Inference, "gen").unwrap_err();
        assert_eq!(
            err.to_string(),
            "gen: training invocation attempted, component expects inference mode"
        );
    }

    #[test]
    fn test_mode_serde() {
        assert_eq!(serde_json::to_string(&Mode::Training).unwrap(), "\"training\"");
        let mode: Mode = serde_json::from_str("\"inference\"").unwrap();
        assert_eq!(mode, Mode::Inference);
        assert!(!mode.is_training());
    }

    #[test]
    fn test_dispatched_accessors() {
        let value: Dispatched<u32> = Dispatched::Value(3);
        assert_eq!(value.param(), None);
        assert_eq!(value.into_value(), Some(3));

        let param: Dispatched<u32> = Dispatched::Param(ParamId(2));
        assert_eq!(param.param(), Some(ParamId(2)));
        assert_eq!(param.into_value(), None);
    }

    #[test]
    fn test_arg_conversions() {
        assert_eq!(Arg::from("q"), Arg::Value(Value::String("q".into())));
        assert_eq!(Arg::from(ParamId(1)), Arg::Param(ParamId(1)));
    }

    #[test]
    fn test_runs_have_distinct_trace_ids() {
        assert_ne!(Run::inference().trace_id(), Run::inference().trace_id());
    }
}
