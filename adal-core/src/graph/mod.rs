//! Parameter graph and textual backward propagation.
//!
//! Pipeline-owned parameters (prompts, demonstrations) live in
//! [`SharedParameter`] slots on their components. Each run builds a fresh
//! [`Graph`] arena: components attach run-local copies of the shared
//! parameters, add nodes for their inputs and outputs, and link them through
//! predecessor handles. After a loss node is added, [`Graph::backward`] walks
//! the arena from the loss toward the optimizable ancestors and collects
//! textual [`Feedback`] on them.
//!
//! ## Successor map functions
//!
//! A node can register a per-successor transform with
//! [`Parameter::add_successor_map_fn`]. The transform runs lazily when the
//! successor resolves the node's value ([`Parameter::resolve_for`]), and
//! registrations for different successors never affect each other.

mod arena;
mod backward;
mod parameter;
mod proptest;

pub use arena::Graph;
pub use backward::{BackwardEngine, BackwardFn, FeedbackRequest};
pub use parameter::{
    shared, value_text, Feedback, MapFn, ParamId, ParamType, Parameter, SharedParameter,
};
