use serde::{Deserialize, Serialize};

use crate::adal::Sample;

/// A multi-hop question answering record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotPotQAData {
    pub id: String,
    pub question: String,
    pub answer: String,
    /// Titles of the gold supporting passages, when the split provides them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold_titles: Option<Vec<String>>,
}

impl HotPotQAData {
    pub fn new(id: impl Into<String>, question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            answer: answer.into(),
            gold_titles: None,
        }
    }
}

impl Sample for HotPotQAData {
    fn id(&self) -> &str {
        &self.id
    }
}
