//! Prompted model call with an optimizable instruction and few-shot demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Arg, ComponentId, GradComponent, Mode, PromptKwargs, Run};
use crate::error::{Error, Result};
use crate::graph::{
    shared, value_text, BackwardEngine, BackwardFn, Feedback, FeedbackRequest, Graph, ParamId,
    ParamType, Parameter, SharedParameter,
};
use crate::llm::{ChatMessage, ModelConfig, RetryPolicy, TokenUsage};
use crate::optim::Demonstration;
use crate::parser::{JsonOutputParser, OutputParser};

/// Feedback given to a prompt whose output already scored perfectly.
const KEEP_FEEDBACK: &str = "The output was correct. Keep this variable as it is.";

/// Result of one generator call.
///
/// Model failures that belong to the sample (exhausted retries, parse
/// failures, refusals) are recorded in `error` instead of failing the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOutput {
    /// Parsed record, absent when generation or parsing failed.
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw model text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl GeneratorOutput {
    pub fn success(data: Value, raw_response: Option<String>) -> Self {
        Self {
            data: Some(data),
            error: None,
            raw_response,
            usage: None,
        }
    }

    pub fn failure(error: impl Into<String>, raw_response: Option<String>) -> Self {
        Self {
            data: None,
            error: Some(error.into()),
            raw_response,
            usage: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The `answer` field of the parsed record, if there is one.
    pub fn answer(&self) -> Option<String> {
        match self.data.as_ref()?.get("answer")? {
            Value::Null => None,
            answer => Some(value_text(answer)),
        }
    }
}

/// Answer extraction policy shared by evaluation and loss: a missing
/// prediction, missing data or missing answer field maps to the empty string.
pub fn answer_or_empty(output: Option<&GeneratorOutput>) -> String {
    output.and_then(|o| o.answer()).unwrap_or_default()
}

/// Prompted model call.
///
/// The system message carries the instruction parameter and the parser's
/// format instructions; demonstrations follow as user/assistant pairs, then
/// the prompt kwargs as `key: value` lines.
pub struct Generator {
    id: ComponentId,
    name: String,
    lm: RwLock<Option<ModelConfig>>,
    teacher: RwLock<Option<ModelConfig>>,
    instruction: SharedParameter,
    demos: SharedParameter,
    parser: Arc<dyn OutputParser>,
    retry: RetryPolicy,
}

impl Generator {
    /// Create a generator answering with a JSON object holding `answer`.
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        let name = name.into();
        let instruction = Parameter::prompt(
            format!("{}_instruction", name),
            instruction,
            "Task instruction for the language model",
        );
        let demos = Parameter::demos(
            format!("{}_few_shot_demos", name),
            "Few-shot examples that show the model how to answer",
        );
        Self {
            id: ComponentId::new(),
            name,
            lm: RwLock::new(None),
            teacher: RwLock::new(None),
            instruction: shared(instruction),
            demos: shared(demos),
            parser: Arc::new(
                JsonOutputParser::new().require("answer", "the final answer, as short as possible"),
            ),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.lm = RwLock::new(Some(model));
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the instruction may be rewritten by the optimizer.
    pub async fn set_instruction_trainable(&self, trainable: bool) {
        self.instruction.write().await.requires_opt = trainable;
    }

    pub fn instruction(&self) -> SharedParameter {
        self.instruction.clone()
    }

    pub fn demos(&self) -> SharedParameter {
        self.demos.clone()
    }

    pub async fn set_model(&self, model: ModelConfig) {
        *self.lm.write().await = Some(model);
    }

    async fn active_model(&self) -> Result<ModelConfig> {
        if let Some(teacher) = self.teacher.read().await.clone() {
            return Ok(teacher);
        }
        self.lm
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Config(format!("no model client configured for generator '{}'", self.name)))
    }

    fn build_prompt(
        &self,
        instruction: &str,
        demos: &[Demonstration],
        inputs: &BTreeMap<String, Value>,
    ) -> Vec<ChatMessage> {
        let mut system = instruction.trim().to_string();
        let format = self.parser.format_instructions();
        if !format.is_empty() {
            system.push_str("\n\n");
            system.push_str(&format);
        }

        let mut messages = vec![ChatMessage::system(system)];
        for demo in demos {
            messages.push(ChatMessage::user(format_inputs(&demo.inputs)));
            messages.push(ChatMessage::assistant(
                serde_json::to_string_pretty(&demo.outputs).unwrap_or_else(|_| demo.outputs.to_string()),
            ));
        }
        messages.push(ChatMessage::user(format_inputs(&inputs_value(inputs))));
        messages
    }

    async fn generate(
        &self,
        instruction: &str,
        demos: &[Demonstration],
        inputs: &BTreeMap<String, Value>,
    ) -> Result<GeneratorOutput> {
        let model = self.active_model().await?;
        let request = model.request(self.build_prompt(instruction, demos, inputs));

        let response = match self
            .retry
            .run(&self.name, || model.client.complete(request.clone()))
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_sample_level() => {
                warn!(generator = %self.name, "generation failed: {}", e);
                return Ok(GeneratorOutput::failure(e.to_string(), None));
            }
            Err(e) => return Err(e),
        };

        let raw = Some(response.content.clone());
        let mut output = if response.is_declined() {
            GeneratorOutput::failure("model declined", raw)
        } else {
            match self.parser.parse(&response.content) {
                Ok(data) => GeneratorOutput::success(data, raw),
                Err(e) => {
                    debug!(generator = %self.name, "unparseable response: {}", e);
                    GeneratorOutput::failure(Error::Parse(e).to_string(), raw)
                }
            }
        };
        output.usage = Some(response.usage);
        Ok(output)
    }

    async fn snapshot(&self) -> Result<(String, Vec<Demonstration>)> {
        let instruction = self.instruction.read().await.data_text();
        let demos = demos_from_value(self.demos.read().await.data())?;
        Ok((instruction, demos))
    }
}

#[async_trait]
impl GradComponent for Generator {
    type Input = PromptKwargs;
    type Output = GeneratorOutput;

    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, run: &Run, input: PromptKwargs) -> Result<GeneratorOutput> {
        run.expect_mode(Mode::Inference, &self.name)?;

        let mut values = BTreeMap::new();
        for (key, arg) in input {
            let value = match arg {
                Arg::Value(v) => v,
                Arg::Param(id) => run.graph().get(id)?.resolve_for(&self.id),
            };
            values.insert(key, value);
        }

        let (instruction, demos) = self.snapshot().await?;
        self.generate(&instruction, &demos, &values).await
    }

    async fn forward(&self, run: &mut Run, input: PromptKwargs) -> Result<ParamId> {
        run.expect_mode(Mode::Training, &self.name)?;
        let graph = run.graph_mut();

        let instruction_id = graph.attach(&*self.instruction.read().await)?;
        let demos_id = graph.attach(&*self.demos.read().await)?;
        let mut predecessors = vec![instruction_id, demos_id];

        let mut values = BTreeMap::new();
        for (key, arg) in input {
            let (id, value) = match arg {
                Arg::Value(v) => {
                    let name = graph.unique_name(&format!("{}_{}", self.name, key));
                    let param = Parameter::input(name, v.clone())
                        .with_role_desc(format!("Input '{}' of {}", key, self.name));
                    (graph.add(param)?, v)
                }
                Arg::Param(id) => (id, graph.get(id)?.resolve_for(&self.id)),
            };
            predecessors.push(id);
            values.insert(key, value);
        }

        let instruction = graph.get(instruction_id)?.data_text();
        let demos = demos_from_value(graph.get(demos_id)?.data())?;
        let output = self.generate(&instruction, &demos, &values).await?;

        let graph = run.graph_mut();
        let name = graph.unique_name(&format!("{}_output", self.name));
        let node = Parameter::output(name, output.data.clone().unwrap_or(Value::Null))
            .with_role_desc(format!("Response of {}", self.name))
            .with_predecessors(predecessors)
            .with_full_response(output)
            .with_grad_fn(Arc::new(GeneratorBackward { inputs: values }));
        graph.add(node)
    }

    fn parameters(&self) -> Vec<SharedParameter> {
        vec![self.instruction.clone(), self.demos.clone()]
    }

    async fn set_teacher(&self, teacher: Option<ModelConfig>) {
        *self.teacher.write().await = teacher;
    }

    async fn validate(&self) -> Result<()> {
        self.active_model().await.map(|_| ())
    }
}

fn demos_from_value(value: &Value) -> Result<Vec<Demonstration>> {
    match value {
        Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other.clone())?),
    }
}

fn inputs_value(inputs: &BTreeMap<String, Value>) -> Value {
    Value::Object(inputs.clone().into_iter().collect())
}

fn format_inputs(inputs: &Value) -> String {
    match inputs {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value_text(value)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => value_text(other),
    }
}

/// Backward step of a generator output.
///
/// Prompt and upstream-output predecessors get feedback from the backward
/// engine. Demonstration slots get the sample trace and its score, which the
/// demo optimizer turns into few-shot examples.
struct GeneratorBackward {
    inputs: BTreeMap<String, Value>,
}

#[async_trait]
impl BackwardFn for GeneratorBackward {
    async fn backward(
        &self,
        engine: &BackwardEngine,
        graph: &Graph,
        output: ParamId,
    ) -> Result<Vec<(ParamId, Feedback)>> {
        let out = graph.get(output)?;
        let score = out.feedback().iter().find_map(|f| f.score);
        let context = match out.full_response().and_then(|r| r.error.as_deref()) {
            Some(error) => format!("{}\nerror: {}", format_inputs(&inputs_value(&self.inputs)), error),
            None => format_inputs(&inputs_value(&self.inputs)),
        };

        let mut updates = Vec::new();
        for &pred in out.predecessors() {
            let target = graph.get(pred)?;
            if !target.requires_opt {
                continue;
            }
            let feedback = match target.param_type {
                ParamType::Demos => {
                    let demo = Demonstration::new(inputs_value(&self.inputs), out.data().clone())
                        .with_score(score);
                    Feedback::new(&out.name, format!("trace of {}", out.name))
                        .with_score(score)
                        .with_demo(demo)
                }
                ParamType::Prompt | ParamType::Output if score == Some(1.0) => {
                    Feedback::new(&out.name, KEEP_FEEDBACK).with_score(score)
                }
                ParamType::Prompt | ParamType::Output => {
                    let text = engine
                        .feedback(FeedbackRequest {
                            target,
                            output: out,
                            context: Some(context.clone()),
                        })
                        .await?;
                    Feedback::new(&out.name, text).with_score(score)
                }
                ParamType::Input | ParamType::Gt => continue,
            };
            updates.push((pred, feedback));
        }
        Ok(updates)
    }
}
