//! Evaluation and training reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    /// Position of the sample in its split.
    pub index: usize,
    pub id: String,
    pub score: f64,
    pub predicted: String,
    pub ground_truth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SampleResult {
    /// A sample that could not be scored normally; it scores 0.
    pub fn failure(index: usize, id: impl Into<String>, ground_truth: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            index,
            id: id.into(),
            score: 0.0,
            predicted: String::new(),
            ground_truth: ground_truth.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Scores of one pass over a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub split: String,
    /// Scored samples in split order.
    pub results: Vec<SampleResult>,
    /// Mean over scored samples; 0 when none were scored.
    pub mean_score: f64,
    pub failure_count: usize,
    /// The run was cancelled before every sample was scored.
    pub cancelled: bool,
}

impl EvalReport {
    pub fn from_results(split: impl Into<String>, mut results: Vec<SampleResult>, cancelled: bool) -> Self {
        results.sort_by_key(|r| r.index);
        let failure_count = results.iter().filter(|r| r.is_failure()).count();
        let mean_score = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
        };
        Self {
            split: split.into(),
            results,
            mean_score,
            failure_count,
            cancelled,
        }
    }
}

/// A rewrite proposed for one parameter during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub param: String,
    pub optimizer: String,
    pub previous: Value,
    pub proposed: Value,
}

/// What happened during one optimization step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub batch: EvalReport,
    pub proposals: Vec<Proposal>,
    /// Validation score with the proposals applied, when there were any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_score: Option<f64>,
    /// Whether the proposals were kept.
    pub accepted: bool,
}

/// Summary of a `fit` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub initial_val_score: f64,
    pub best_val_score: f64,
    pub steps: Vec<StepRecord>,
    /// Final values of the pipeline's optimizable parameters.
    pub parameters: BTreeMap<String, Value>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, score: f64) -> SampleResult {
        SampleResult {
            index,
            id: format!("s{}", index),
            score,
            predicted: "x".into(),
            ground_truth: "x".into(),
            error: None,
        }
    }

    #[test]
    fn test_report_orders_and_aggregates() {
        let report = EvalReport::from_results(
            "val",
            vec![result(2, 1.0), SampleResult::failure(0, "s0", "yes", "timeout"), result(1, 0.5)],
            false,
        );
        let order: Vec<usize> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report.failure_count, 1);
        assert!((report.mean_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report_scores_zero() {
        let report = EvalReport::from_results("val", Vec::new(), true);
        assert_eq!(report.mean_score, 0.0);
        assert!(report.cancelled);
    }
}
