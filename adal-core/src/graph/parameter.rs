//! Parameter nodes: values plus the metadata the optimizer needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::backward::BackwardFn;
use crate::component::{ComponentId, GeneratorOutput};
use crate::error::{Error, Result};
use crate::optim::Demonstration;

/// Handle of a node inside a [`Graph`](super::Graph) arena.
///
/// Handles are issued in creation order, so a node's predecessors always
/// carry smaller handles than the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of value a parameter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Prompt text such as task instructions.
    Prompt,
    /// Few-shot demonstrations injected into a prompt.
    Demos,
    /// Output of a component.
    Output,
    /// Input handed to a component.
    Input,
    /// Ground truth used by a loss.
    Gt,
}

/// Transform applied to a parameter's value when a specific successor reads it.
pub type MapFn = Arc<dyn Fn(&Parameter) -> Value + Send + Sync>;

/// Pipeline-owned parameter shared across runs and samples.
pub type SharedParameter = Arc<RwLock<Parameter>>;

/// Wrap a parameter for ownership by a component.
pub fn shared(param: Parameter) -> SharedParameter {
    Arc::new(RwLock::new(param))
}

/// Textual feedback delivered to a parameter during the backward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Name of the parameter whose backward step produced this feedback.
    pub from: String,
    /// Feedback text.
    pub text: String,
    /// Eval score of the sample the feedback came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Input/output trace of the sample, for demonstration parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demo: Option<Demonstration>,
}

impl Feedback {
    pub fn new(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            score: None,
            demo: None,
        }
    }

    pub fn with_score(mut self, score: Option<f64>) -> Self {
        self.score = score;
        self
    }

    pub fn with_demo(mut self, demo: Demonstration) -> Self {
        self.demo = Some(demo);
        self
    }
}

/// A named value in the computation graph.
///
/// `eval_input` is recomputed whenever `data` changes, so it always reflects
/// the latest value; [`Parameter::derive_eval_input`] is the only other
/// writer.
#[derive(Clone)]
pub struct Parameter {
    /// Name, unique within a graph.
    pub name: String,
    /// Human-readable purpose, shown to the backward engine and optimizer.
    pub role_desc: String,
    pub param_type: ParamType,
    /// Whether the optimizer may rewrite `data`.
    pub requires_opt: bool,
    data: Value,
    eval_input: Value,
    full_response: Option<GeneratorOutput>,
    predecessors: Vec<ParamId>,
    successor_map_fns: HashMap<ComponentId, MapFn>,
    feedback: Vec<Feedback>,
    grad_fn: Option<Arc<dyn BackwardFn>>,
    attached: bool,
}

impl Parameter {
    /// Create a parameter; it is optimizable unless configured otherwise.
    pub fn new(name: impl Into<String>, data: impl Into<Value>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            role_desc: String::new(),
            param_type: ParamType::Input,
            requires_opt: true,
            eval_input: data.clone(),
            data,
            full_response: None,
            predecessors: Vec::new(),
            successor_map_fns: HashMap::new(),
            feedback: Vec::new(),
            grad_fn: None,
            attached: false,
        }
    }

    /// Optimizable prompt text.
    pub fn prompt(name: impl Into<String>, text: impl Into<String>, role_desc: impl Into<String>) -> Self {
        Self::new(name, Value::String(text.into()))
            .with_type(ParamType::Prompt)
            .with_role_desc(role_desc)
    }

    /// Optimizable demonstration slot, initially empty.
    pub fn demos(name: impl Into<String>, role_desc: impl Into<String>) -> Self {
        Self::new(name, Value::Array(Vec::new()))
            .with_type(ParamType::Demos)
            .with_role_desc(role_desc)
    }

    /// Fixed input value.
    pub fn input(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(name, data)
            .with_type(ParamType::Input)
            .with_requires_opt(false)
    }

    /// Fixed ground truth value.
    pub fn ground_truth(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(name, data)
            .with_type(ParamType::Gt)
            .with_requires_opt(false)
    }

    /// Component output; feedback flows through it to its predecessors.
    pub fn output(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(name, data).with_type(ParamType::Output)
    }

    pub fn with_type(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }

    pub fn with_role_desc(mut self, role_desc: impl Into<String>) -> Self {
        self.role_desc = role_desc.into();
        self
    }

    pub fn with_requires_opt(mut self, requires_opt: bool) -> Self {
        self.requires_opt = requires_opt;
        self
    }

    pub fn with_predecessors(mut self, predecessors: Vec<ParamId>) -> Self {
        self.predecessors = predecessors;
        self
    }

    pub fn with_full_response(mut self, response: GeneratorOutput) -> Self {
        self.full_response = Some(response);
        self
    }

    pub fn with_grad_fn(mut self, grad_fn: Arc<dyn BackwardFn>) -> Self {
        self.grad_fn = Some(grad_fn);
        self
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Data as prompt text: strings verbatim, null as empty, anything else as JSON.
    pub fn data_text(&self) -> String {
        value_text(&self.data)
    }

    /// Rewrite the value. Refused for parameters with `requires_opt = false`.
    pub fn update(&mut self, data: Value) -> Result<()> {
        if !self.requires_opt {
            return Err(Error::graph(format!(
                "parameter '{}' is not optimizable",
                self.name
            )));
        }
        self.eval_input = data.clone();
        self.data = data;
        Ok(())
    }

    pub fn eval_input(&self) -> &Value {
        &self.eval_input
    }

    /// Recompute the value scored by eval and loss functions.
    pub fn derive_eval_input(&mut self, derive: impl FnOnce(&Parameter) -> Value) {
        self.eval_input = derive(self);
    }

    pub fn full_response(&self) -> Option<&GeneratorOutput> {
        self.full_response.as_ref()
    }

    pub fn predecessors(&self) -> &[ParamId] {
        &self.predecessors
    }

    /// Register how `successor` should see this parameter's value.
    ///
    /// Registrations are keyed by successor, so adding one never changes
    /// what another successor resolves.
    pub fn add_successor_map_fn<F>(&mut self, successor: ComponentId, map_fn: F)
    where
        F: Fn(&Parameter) -> Value + Send + Sync + 'static,
    {
        self.successor_map_fns.insert(successor, Arc::new(map_fn));
    }

    pub fn has_successor_map_fn(&self, successor: &ComponentId) -> bool {
        self.successor_map_fns.contains_key(successor)
    }

    /// Value handed to `successor`: its map fn applied lazily, or the raw data.
    pub fn resolve_for(&self, successor: &ComponentId) -> Value {
        match self.successor_map_fns.get(successor) {
            Some(map_fn) => map_fn(self),
            None => self.data.clone(),
        }
    }

    pub fn feedback(&self) -> &[Feedback] {
        &self.feedback
    }

    /// Store feedback. Parameters with `requires_opt = false` drop it.
    pub(crate) fn push_feedback(&mut self, feedback: Feedback) -> bool {
        if !self.requires_opt {
            return false;
        }
        self.feedback.push(feedback);
        true
    }

    pub(crate) fn grad_fn(&self) -> Option<Arc<dyn BackwardFn>> {
        self.grad_fn.clone()
    }

    /// Whether this node is a run-local copy of a pipeline-owned parameter.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Run-local copy of a pipeline-owned parameter: same value and metadata,
    /// no graph state.
    pub(crate) fn detached_copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            role_desc: self.role_desc.clone(),
            param_type: self.param_type,
            requires_opt: self.requires_opt,
            data: self.data.clone(),
            eval_input: self.eval_input.clone(),
            full_response: None,
            predecessors: Vec::new(),
            successor_map_fns: HashMap::new(),
            feedback: Vec::new(),
            grad_fn: None,
            attached: true,
        }
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("requires_opt", &self.requires_opt)
            .field("data", &self.data)
            .field("eval_input", &self.eval_input)
            .field("predecessors", &self.predecessors)
            .field("feedback", &self.feedback.len())
            .field("attached", &self.attached)
            .finish()
    }
}

/// Render a JSON value as prompt text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
