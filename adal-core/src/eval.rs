//! Evaluation functions scoring a predicted answer against ground truth.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Scores a prediction against the ground truth.
///
/// Scores are in `[0, 1]`; an empty prediction scores like any wrong answer.
pub trait EvalFn: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, predicted: &str, ground_truth: &str) -> f64;
}

fn articles() -> Option<&'static Regex> {
    static ARTICLES: OnceLock<Option<Regex>> = OnceLock::new();
    ARTICLES
        .get_or_init(|| Regex::new(r"\b(a|an|the)\b").ok())
        .as_ref()
}

/// SQuAD-style normalization: lowercase, drop punctuation and articles,
/// collapse whitespace.
pub fn normalize_answer(text: &str) -> String {
    let lower = text.to_lowercase();
    let no_punct: String = lower
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    let no_articles = match articles() {
        Some(re) => re.replace_all(&no_punct, " ").into_owned(),
        None => no_punct,
    };
    no_articles.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 1.0 when the normalized answers are equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl EvalFn for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn score(&self, predicted: &str, ground_truth: &str) -> f64 {
        if normalize_answer(predicted) == normalize_answer(ground_truth) {
            1.0
        } else {
            0.0
        }
    }
}

/// 1.0 when the normalized ground truth occurs in the normalized prediction.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyMatch;

impl EvalFn for FuzzyMatch {
    fn name(&self) -> &str {
        "fuzzy_match"
    }

    fn score(&self, predicted: &str, ground_truth: &str) -> f64 {
        let gt = normalize_answer(ground_truth);
        let pred = normalize_answer(predicted);
        if gt.is_empty() {
            return if pred.is_empty() { 1.0 } else { 0.0 };
        }
        if format!(" {} ", pred).contains(&format!(" {} ", gt)) {
            1.0
        } else {
            0.0
        }
    }
}

/// Harmonic mean of token precision and recall after normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenF1;

impl EvalFn for TokenF1 {
    fn name(&self) -> &str {
        "token_f1"
    }

    fn score(&self, predicted: &str, ground_truth: &str) -> f64 {
        let pred = normalize_answer(predicted);
        let gt = normalize_answer(ground_truth);
        let pred_tokens: Vec<&str> = pred.split_whitespace().collect();
        let gt_tokens: Vec<&str> = gt.split_whitespace().collect();
        if pred_tokens.is_empty() || gt_tokens.is_empty() {
            return if pred_tokens == gt_tokens { 1.0 } else { 0.0 };
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in &gt_tokens {
            *counts.entry(*token).or_default() += 1;
        }
        let mut common = 0usize;
        for token in &pred_tokens {
            if let Some(n) = counts.get_mut(token) {
                if *n > 0 {
                    *n -= 1;
                    common += 1;
                }
            }
        }
        if common == 0 {
            return 0.0;
        }

        let precision = common as f64 / pred_tokens.len() as f64;
        let recall = common as f64 / gt_tokens.len() as f64;
        2.0 * precision * recall / (precision + recall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_answer() {
        assert_eq!(normalize_answer("  The  Eiffel Tower! "), "eiffel tower");
        assert_eq!(normalize_answer("Yes."), "yes");
        assert_eq!(normalize_answer(""), "");
    }

    #[test]
    fn test_exact_match() {
        assert_eq!(ExactMatch.score("Yes", "yes"), 1.0);
        assert_eq!(ExactMatch.score("the answer is yes", "yes"), 0.0);
        assert_eq!(ExactMatch.score("", "yes"), 0.0);
    }

    #[test]
    fn test_fuzzy_match() {
        assert_eq!(FuzzyMatch.score("The answer is yes.", "yes"), 1.0);
        assert_eq!(FuzzyMatch.score("yesterday", "yes"), 0.0);
        assert_eq!(FuzzyMatch.score("", "yes"), 0.0);
    }

    #[test]
    fn test_token_f1() {
        assert_eq!(TokenF1.score("Ed Wood", "Ed Wood"), 1.0);
        let partial = TokenF1.score("Ed Wood Jr", "Ed Wood");
        assert!((partial - 0.8).abs() < 1e-9);
        assert_eq!(TokenF1.score("", "Ed Wood"), 0.0);
    }

    proptest! {
        #[test]
        fn scores_stay_in_unit_interval(pred in ".{0,40}", gt in ".{0,40}") {
            for eval in [&ExactMatch as &dyn EvalFn, &FuzzyMatch, &TokenF1] {
                let score = eval.score(&pred, &gt);
                prop_assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
