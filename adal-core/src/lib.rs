//! # adal-core
//!
//! LLM pipeline components that run in two modes and learn from textual
//! feedback.
//!
//! ## Core Components
//!
//! - **Component**: [`GradComponent`]s with an inference `call` body and a
//!   training `forward` body, chosen per invocation by [`Run`]
//! - **Graph**: [`Parameter`] nodes recorded during training, with a backward
//!   pass that turns scores into feedback text
//! - **RAG**: a [`Retriever`] → [`Generator`] pipeline ([`RagTask`])
//! - **Agent**: a [`Runner`] planning tool calls step by step until `finish`
//! - **Trainer**: [`Trainer::diagnose`] and [`Trainer::fit`] over an
//!   [`AdalComponent`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use adal_core::{
//!     Generator, HotPotQAData, InMemoryBackend, ModelRoles, RagAdal, RagTask, Retriever,
//!     Trainer, TrainerConfig,
//! };
//!
//! let retriever = Retriever::new("retriever", Arc::new(InMemoryBackend::new(passages)));
//! let generator = Generator::new("generator", "Answer the question from the context.")
//!     .with_model(student);
//! let adal = RagAdal::new(
//!     RagTask::new(retriever, generator),
//!     ModelRoles::new().with_backward_engine(engine).with_teacher(teacher),
//! );
//!
//! let trainer = Trainer::new(adal, TrainerConfig::from_env());
//! let before = trainer.diagnose(&test, "test").await?;
//! let report = trainer.fit(&train, &val).await?;
//! println!("{} -> {}", before.mean_score, report.best_val_score);
//! ```

pub mod adal;
pub mod agent;
pub mod component;
pub mod config;
pub mod error;
pub mod eval;
pub mod graph;
pub mod llm;
pub mod loss;
pub mod optim;
pub mod parser;
pub mod rag;
pub mod trainer;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use adal::{AdalComponent, EvalCall, LossCall, ModelRoles, Sample, TaskCall};
pub use agent::{FunctionCall, Runner, RunnerOutput, StepOutput, Tool, ToolSet};
pub use component::{
    Arg, ComponentId, Dispatched, GradComponent, Generator, GeneratorOutput, InMemoryBackend,
    Mode, PromptKwargs, RetrievedDocument, Retriever, RetrieverBackend, RetrieverOutput, Run,
};
pub use config::TrainerConfig;
pub use error::{Error, ModelCallKind, Result};
pub use eval::{EvalFn, ExactMatch, FuzzyMatch, TokenF1};
pub use graph::{BackwardEngine, Feedback, Graph, ParamId, ParamType, Parameter, SharedParameter};
pub use llm::{
    AnthropicClient, ChatMessage, ClientConfig, CompletionRequest, CompletionResponse,
    LLMClient, ModelConfig, ModelKwargs, OpenAIClient, Provider, RetryPolicy,
};
pub use loss::{LossFn, TextLoss};
pub use optim::{DemoOptimizer, Demonstration, Optimizer, TextOptimizer};
pub use parser::{JsonOutputParser, OutputParser, ParseError};
pub use rag::{HotPotQAData, RagQuery, RagTask, RagAdal};
pub use trainer::{CancelToken, EvalReport, SampleResult, TrainReport, Trainer};
