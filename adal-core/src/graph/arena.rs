//! Per-run parameter arena.

use std::collections::{HashMap, HashSet, VecDeque};

use super::parameter::{Feedback, ParamId, Parameter};
use crate::error::{Error, Result};

/// Directed graph of the parameters produced during one run.
///
/// Nodes live in a `Vec` and refer to their predecessors by [`ParamId`].
/// A node may only reference nodes that already exist, so handles are a
/// topological order and the graph is acyclic by construction.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Parameter>,
    by_name: HashMap<String, ParamId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node. Its name must be unused and its predecessors must exist.
    pub fn add(&mut self, param: Parameter) -> Result<ParamId> {
        if self.by_name.contains_key(&param.name) {
            return Err(Error::graph(format!(
                "a parameter named '{}' already exists in this run",
                param.name
            )));
        }
        let id = ParamId(self.nodes.len());
        if let Some(missing) = param.predecessors().iter().find(|p| p.0 >= id.0) {
            return Err(Error::graph(format!(
                "parameter '{}' references unknown predecessor {}",
                param.name, missing
            )));
        }
        self.by_name.insert(param.name.clone(), id);
        self.nodes.push(param);
        Ok(id)
    }

    /// Add a run-local copy of a pipeline-owned parameter.
    ///
    /// Attaching the same parameter twice returns the existing node, so all
    /// uses of a shared prompt within a run collect feedback in one place.
    /// A different parameter under an attached name is rejected.
    pub fn attach(&mut self, param: &Parameter) -> Result<ParamId> {
        if let Some(&id) = self.by_name.get(&param.name) {
            let existing = &self.nodes[id.0];
            if !existing.is_attached() {
                return Err(Error::graph(format!(
                    "cannot attach '{}': name taken by a run-local parameter",
                    param.name
                )));
            }
            if existing.param_type != param.param_type
                || existing.role_desc != param.role_desc
                || existing.data() != param.data()
            {
                return Err(Error::graph(format!(
                    "cannot attach '{}': another parameter with this name is already attached",
                    param.name
                )));
            }
            return Ok(id);
        }
        self.add(param.detached_copy())
    }

    pub fn get(&self, id: ParamId) -> Result<&Parameter> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::graph(format!("unknown parameter {}", id)))
    }

    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut Parameter> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| Error::graph(format!("unknown parameter {}", id)))
    }

    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.nodes.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    /// `"{prefix}_{n}"` with the smallest `n >= len` that is still free.
    pub fn unique_name(&self, prefix: &str) -> String {
        let mut n = self.nodes.len();
        loop {
            let name = format!("{}_{}", prefix, n);
            if !self.by_name.contains_key(&name) {
                return name;
            }
            n += 1;
        }
    }

    /// Nodes reachable backward from `root`, in descending handle order.
    ///
    /// Every node appears once even when ancestors are shared. Predecessors
    /// with `requires_opt = false` are neither returned nor walked through.
    pub fn reachable_from(&self, root: ParamId) -> Result<Vec<ParamId>> {
        self.get(root)?;
        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);

        while let Some(id) = queue.pop_front() {
            for &pred in self.nodes[id.0].predecessors() {
                if !self.nodes[pred.0].requires_opt {
                    continue;
                }
                if visited.insert(pred) {
                    queue.push_back(pred);
                }
            }
        }

        let mut order: Vec<ParamId> = visited.into_iter().collect();
        order.sort_unstable_by(|a, b| b.cmp(a));
        Ok(order)
    }

    /// Deliver feedback to a node; fixed parameters drop it.
    pub fn add_feedback(&mut self, id: ParamId, feedback: Feedback) -> Result<bool> {
        Ok(self.get_mut(id)?.push_feedback(feedback))
    }

    /// Feedback collected on pipeline-owned parameters, keyed by name.
    pub fn attached_feedback(&self) -> HashMap<String, Vec<Feedback>> {
        self.nodes
            .iter()
            .filter(|p| p.is_attached() && !p.feedback().is_empty())
            .map(|p| (p.name.clone(), p.feedback().to_vec()))
            .collect()
    }
}
