//! Few-shot demonstration bootstrapping.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::Optimizer;
use crate::error::Result;
use crate::graph::{Feedback, ParamType, Parameter};

/// An input/output example shown to a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    pub inputs: Value,
    pub outputs: Value,
    /// Eval score of the run the example was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Demonstration {
    pub fn new(inputs: Value, outputs: Value) -> Self {
        Self {
            inputs,
            outputs,
            score: None,
        }
    }

    pub fn with_score(mut self, score: Option<f64>) -> Self {
        self.score = score;
        self
    }
}

/// Fills demonstration slots with the best-scoring traces of a step.
///
/// New traces come first, then the demonstrations already in the slot;
/// duplicates by input are dropped and the list is capped at `max_demos`.
#[derive(Debug, Clone)]
pub struct DemoOptimizer {
    max_demos: usize,
    min_score: f64,
}

impl Default for DemoOptimizer {
    fn default() -> Self {
        Self {
            max_demos: 4,
            min_score: 1.0,
        }
    }
}

impl DemoOptimizer {
    pub fn new(max_demos: usize) -> Self {
        Self {
            max_demos,
            ..Self::default()
        }
    }

    /// Lowest score a trace needs to become a demonstration.
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }
}

#[async_trait]
impl Optimizer for DemoOptimizer {
    fn name(&self) -> &str {
        "demo_optimizer"
    }

    fn accepts(&self, param: &Parameter) -> bool {
        param.requires_opt && param.param_type == ParamType::Demos
    }

    async fn propose(&self, param: &Parameter, feedback: &[Feedback]) -> Result<Option<Value>> {
        let mut candidates: Vec<&Demonstration> = feedback
            .iter()
            .filter_map(|f| f.demo.as_ref())
            .filter(|d| d.score.unwrap_or(0.0) >= self.min_score)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0))
        });

        let current: Vec<Demonstration> = match param.data() {
            Value::Null => Vec::new(),
            data => serde_json::from_value(data.clone())?,
        };

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for demo in candidates.into_iter().chain(current.iter()) {
            if selected.len() == self.max_demos {
                break;
            }
            if seen.insert(demo.inputs.to_string()) {
                selected.push(demo.clone());
            }
        }

        if selected == current {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(selected)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace(question: &str, score: f64) -> Feedback {
        let demo = Demonstration::new(json!({"question": question}), json!({"answer": "x"}))
            .with_score(Some(score));
        Feedback::new("gen_output", "trace").with_score(Some(score)).with_demo(demo)
    }

    #[tokio::test]
    async fn test_keeps_best_traces_up_to_cap() {
        let optimizer = DemoOptimizer::new(2).with_min_score(0.5);
        let slot = Parameter::demos("few_shot_demos", "examples");
        let feedback = vec![trace("a", 0.6), trace("b", 0.0), trace("c", 1.0), trace("d", 0.9)];

        let proposal = optimizer.propose(&slot, &feedback).await.unwrap().unwrap();
        let demos: Vec<Demonstration> = serde_json::from_value(proposal).unwrap();
        let questions: Vec<&str> = demos.iter().map(|d| d.inputs["question"].as_str().unwrap()).collect();
        assert_eq!(questions, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_no_proposal_without_good_traces() {
        let optimizer = DemoOptimizer::default();
        let slot = Parameter::demos("few_shot_demos", "examples");
        assert!(optimizer.propose(&slot, &[trace("a", 0.0)]).await.unwrap().is_none());
        assert!(optimizer
            .propose(&slot, &[Feedback::new("loss", "text only")])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_inputs_collapse() {
        let optimizer = DemoOptimizer::new(4);
        let mut slot = Parameter::demos("few_shot_demos", "examples");
        let existing = Demonstration::new(json!({"question": "a"}), json!({"answer": "old"}));
        slot.update(json!([existing])).unwrap();

        let proposal = optimizer.propose(&slot, &[trace("a", 1.0)]).await.unwrap().unwrap();
        let demos: Vec<Demonstration> = serde_json::from_value(proposal).unwrap();
        assert_eq!(demos.len(), 1);
        assert_eq!(demos[0].outputs, json!({"answer": "x"}));
    }

    #[test]
    fn test_accepts_only_optimizable_demos() {
        let optimizer = DemoOptimizer::default();
        assert!(optimizer.accepts(&Parameter::demos("d", "examples")));
        assert!(!optimizer.accepts(&Parameter::prompt("p", "x", "instruction")));
        assert!(!optimizer.accepts(&Parameter::demos("d", "examples").with_requires_opt(false)));
    }
}
