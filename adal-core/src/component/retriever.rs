//! Retrieval step: query in, ranked documents out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{ComponentId, GradComponent, Mode, Run};
use crate::error::{Error, Result};
use crate::graph::{ParamId, Parameter};

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl RetrievedDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            score: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Retrieval capability: document store, vector index or search API.
///
/// An empty result is valid and means "no context".
#[async_trait]
pub trait RetrieverBackend: Send + Sync {
    /// At most `k` documents for `query`, best first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>>;
}

/// Output of a [`Retriever`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieverOutput {
    pub query: String,
    pub documents: Vec<RetrievedDocument>,
}

impl RetrieverOutput {
    pub fn texts(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.text.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// In-memory backend ranking passages by query term overlap.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    documents: Vec<String>,
}

impl InMemoryBackend {
    pub fn new<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: documents.into_iter().map(Into::into).collect(),
        }
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl RetrieverBackend for InMemoryBackend {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f64)> = self
            .documents
            .iter()
            .enumerate()
            .filter_map(|(i, doc)| {
                let overlap = terms(doc).intersection(&query_terms).count();
                (overlap > 0).then(|| (i, overlap as f64 / query_terms.len() as f64))
            })
            .collect();
        // Stable sort keeps insertion order among ties.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| RetrievedDocument::new(self.documents[i].clone()).with_score(score))
            .collect())
    }
}

/// Component wrapping a [`RetrieverBackend`].
pub struct Retriever {
    id: ComponentId,
    name: String,
    backend: Arc<dyn RetrieverBackend>,
    top_k: usize,
}

impl Retriever {
    pub fn new(name: impl Into<String>, backend: Arc<dyn RetrieverBackend>) -> Self {
        Self {
            id: ComponentId::new(),
            name: name.into(),
            backend,
            top_k: 3,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    async fn retrieve(&self, query: &str) -> Result<RetrieverOutput> {
        let mut documents = self
            .backend
            .retrieve(query, self.top_k)
            .await
            .map_err(|e| match e {
                Error::Retrieval(_) => e,
                other if other.is_sample_level() => Error::Retrieval(other.to_string()),
                // Misconfiguration aborts the run instead of failing each sample.
                other => other,
            })?;
        documents.truncate(self.top_k);
        debug!(retriever = %self.name, count = documents.len(), "retrieved documents");
        Ok(RetrieverOutput {
            query: query.to_string(),
            documents,
        })
    }
}

#[async_trait]
impl GradComponent for Retriever {
    type Input = String;
    type Output = RetrieverOutput;

    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, run: &Run, query: String) -> Result<RetrieverOutput> {
        run.expect_mode(Mode::Inference, &self.name)?;
        self.retrieve(&query).await
    }

    async fn forward(&self, run: &mut Run, query: String) -> Result<ParamId> {
        run.expect_mode(Mode::Training, &self.name)?;
        let output = self.retrieve(&query).await?;

        let graph = run.graph_mut();
        let query_name = graph.unique_name(&format!("{}_query", self.name));
        let query_id = graph.add(
            Parameter::input(query_name, query).with_role_desc(format!("Query sent to {}", self.name)),
        )?;
        let name = graph.unique_name(&format!("{}_output", self.name));
        graph.add(
            Parameter::output(name, serde_json::to_value(&output)?)
                .with_role_desc(format!("Documents retrieved by {}", self.name))
                .with_predecessors(vec![query_id]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticRetriever;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_truncates_to_top_k() {
        let backend = Arc::new(StaticRetriever::new(["a", "b", "c", "d"]));
        let retriever = Retriever::new("docs", backend).with_top_k(2);
        let output = retriever
            .call(&Run::inference(), "q".to_string())
            .await
            .unwrap();
        assert_eq!(output.texts(), vec!["a", "b"]);
        assert_eq!(output.query, "q");
    }

    #[tokio::test]
    async fn test_forward_records_query_and_output() {
        let backend = Arc::new(StaticRetriever::new(["a"]));
        let retriever = Retriever::new("docs", backend);
        let mut run = Run::training();
        let out = retriever.forward(&mut run, "q".to_string()).await.unwrap();

        let node = run.graph().get(out).unwrap();
        assert_eq!(node.data()["documents"][0]["text"], json!("a"));
        assert!(node.requires_opt);
        let query = run.graph().get(node.predecessors()[0]).unwrap();
        assert_eq!(query.data(), &json!("q"));
        assert!(!query.requires_opt);
    }

    #[tokio::test]
    async fn test_mode_exclusivity() {
        let retriever = Retriever::new("docs", Arc::new(StaticRetriever::new(["a"])));
        assert!(matches!(
            retriever.call(&Run::training(), "q".into()).await,
            Err(Error::InvalidMode { .. })
        ));
        assert!(matches!(
            retriever.forward(&mut Run::inference(), "q".into()).await,
            Err(Error::InvalidMode { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_is_retrieval_error() {
        let retriever = Retriever::new("docs", Arc::new(StaticRetriever::failing()));
        let err = retriever
            .call(&Run::inference(), "q".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Retrieval(_)));
        assert!(err.is_sample_level());
    }

    #[tokio::test]
    async fn test_backend_errors_keep_their_severity() {
        let unreachable = Retriever::new(
            "docs",
            Arc::new(StaticRetriever::failing_with(|| Error::timeout(250))),
        );
        let err = unreachable.call(&Run::inference(), "q".into()).await.unwrap_err();
        assert_eq!(err.to_string(), "Retrieval error: Operation timed out after 250ms");

        let misconfigured = Retriever::new(
            "docs",
            Arc::new(StaticRetriever::failing_with(|| {
                Error::Config("vector index path not configured".to_string())
            })),
        );
        let err = misconfigured
            .forward(&mut Run::training(), "q".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_sample_level());
    }

    #[tokio::test]
    async fn test_in_memory_backend_ranks_by_overlap() {
        let backend = InMemoryBackend::new([
            "Ed Wood was an American filmmaker.",
            "Paris is the capital of France.",
            "Scott Derrickson is an American director, like Ed Wood.",
        ]);
        let docs = backend
            .retrieve("Scott Derrickson and Ed Wood", 2)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].text.starts_with("Scott Derrickson"));
        assert!(docs[1].text.starts_with("Ed Wood"));
        assert!(backend.retrieve("zzz unknown", 2).await.unwrap().is_empty());
    }
}
