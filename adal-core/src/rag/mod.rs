//! Retrieval-augmented question answering.
//!
//! [`RagTask`] wires a [`Retriever`] into a [`Generator`]: the retrieved
//! passages are reduced to one context string (passages joined by a blank
//! line, empty when nothing was found) and passed next to the question.
//! In training runs the reduction is registered as a successor map fn on the
//! retriever's output node, so the generator reads the same context while
//! the graph keeps the link back to the retrieval.

mod adal;
mod data;

pub use adal::RagAdal;
pub use data::HotPotQAData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::component::{
    Arg, ComponentId, Dispatched, GeneratorOutput, Generator, GradComponent, Mode, PromptKwargs,
    Retriever, RetrieverOutput, Run,
};
use crate::error::Result;
use crate::graph::{ParamId, Parameter, SharedParameter};
use crate::llm::ModelConfig;

/// Separator between retrieved passages in the generator context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Join retrieved passages into the generator context.
pub fn format_context(output: &RetrieverOutput) -> String {
    output.texts().join(CONTEXT_SEPARATOR)
}

/// [`format_context`] over a retriever output node; unreadable data maps to
/// the empty context.
fn context_from_param(param: &Parameter) -> Value {
    let context = serde_json::from_value::<RetrieverOutput>(param.data().clone())
        .map(|output| format_context(&output))
        .unwrap_or_default();
    Value::String(context)
}

/// Input of a [`RagTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQuery {
    pub question: String,
    /// Sample handle for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl RagQuery {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Retriever followed by a generator.
pub struct RagTask {
    id: ComponentId,
    name: String,
    retriever: Retriever,
    generator: Generator,
}

impl RagTask {
    pub fn new(retriever: Retriever, generator: Generator) -> Self {
        Self {
            id: ComponentId::new(),
            name: "rag".to_string(),
            retriever,
            generator,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    fn kwargs(question: String, context: Arg) -> PromptKwargs {
        PromptKwargs::from([
            ("question".to_string(), Arg::from(question)),
            ("context".to_string(), context),
        ])
    }

    fn wire_context(&self, run: &mut Run, retrieved: ParamId) -> Result<Arg> {
        run.graph_mut()
            .get_mut(retrieved)?
            .add_successor_map_fn(self.generator.id(), context_from_param);
        Ok(Arg::Param(retrieved))
    }
}

#[async_trait]
impl GradComponent for RagTask {
    type Input = RagQuery;
    type Output = GeneratorOutput;

    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, run: &Run, query: RagQuery) -> Result<GeneratorOutput> {
        run.expect_mode(Mode::Inference, &self.name)?;
        let retrieved = self.retriever.call(run, query.question.clone()).await?;
        let context = format_context(&retrieved);
        debug!(sample_id = ?query.id, passages = retrieved.documents.len(), "rag call");
        self.generator
            .call(run, Self::kwargs(query.question, Arg::from(context)))
            .await
    }

    async fn forward(&self, run: &mut Run, query: RagQuery) -> Result<ParamId> {
        run.expect_mode(Mode::Training, &self.name)?;
        let retrieved = self.retriever.forward(run, query.question.clone()).await?;
        let context = self.wire_context(run, retrieved)?;
        debug!(sample_id = ?query.id, "rag forward");
        self.generator
            .forward(run, Self::kwargs(query.question, context))
            .await
    }

    /// Single path for both modes: the retriever's dispatched result decides
    /// whether the context is reduced now or through a successor map fn.
    async fn dispatch(&self, run: &mut Run, query: RagQuery) -> Result<Dispatched<GeneratorOutput>> {
        let context = match self.retriever.dispatch(run, query.question.clone()).await? {
            Dispatched::Value(retrieved) => Arg::from(format_context(&retrieved)),
            Dispatched::Param(retrieved) => self.wire_context(run, retrieved)?,
        };
        self.generator
            .dispatch(run, Self::kwargs(query.question, context))
            .await
    }

    fn parameters(&self) -> Vec<SharedParameter> {
        self.generator.parameters()
    }

    async fn set_teacher(&self, teacher: Option<ModelConfig>) {
        self.generator.set_teacher(teacher).await;
    }

    async fn validate(&self) -> Result<()> {
        self.generator.validate().await
    }
}
