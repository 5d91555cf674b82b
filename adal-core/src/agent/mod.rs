//! Multi-step tool-using agent.
//!
//! A [`Runner`] asks its planner [`Generator`] for one function call per
//! step, executes it with the matching [`Tool`] and feeds the step history
//! back into the next prompt. The loop ends when the planner calls
//! `finish`, whose `answer` argument becomes the run's answer, or after
//! `max_steps` steps without one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use adal_core::agent::Runner;
//! use adal_core::component::{GradComponent, Run};
//!
//! let runner = Runner::new("agent", planner).with_tool(Arc::new(Search::new(index)));
//! let output = runner.call(&Run::inference(), kwargs).await?;
//! let answer: Option<Answer> = output.answer_as()?;
//! ```

mod tool;

pub use tool::{Tool, ToolSet};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::component::{
    Arg, ComponentId, Generator, GeneratorOutput, GradComponent, Mode, PromptKwargs, Run,
};
use crate::error::{Error, Result};
use crate::graph::{
    value_text, BackwardEngine, BackwardFn, Feedback, Graph, ParamId, Parameter, SharedParameter,
};
use crate::llm::ModelConfig;
use crate::parser::JsonOutputParser;
use crate::trainer::CancelToken;

/// Name of the built-in call that ends a run.
pub const FINISH: &str = "finish";

/// One function call chosen by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// A completed step: the call and what it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step: usize,
    pub action: FunctionCall,
    pub observation: Value,
}

/// Step history of a run and its final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerOutput {
    pub steps: Vec<StepOutput>,
    /// `answer` argument of the `finish` call; absent when the step budget
    /// ran out first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
}

impl RunnerOutput {
    pub fn is_finished(&self) -> bool {
        self.answer.is_some()
    }

    /// The answer cast to `T`.
    pub fn answer_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.answer {
            None => Ok(None),
            Some(answer) => Ok(Some(serde_json::from_value(answer.clone())?)),
        }
    }
}

/// Planner loop over a set of tools.
pub struct Runner {
    id: ComponentId,
    name: String,
    planner: Generator,
    tools: ToolSet,
    max_steps: usize,
    cancel: CancelToken,
}

impl Runner {
    /// Wrap `planner`, whose parser is replaced by one expecting a
    /// `{"name": .., "args": ..}` function call.
    pub fn new(name: impl Into<String>, planner: Generator) -> Self {
        let parser = JsonOutputParser::new()
            .require("name", "the tool to call, or \"finish\" once the task is done")
            .require("args", "JSON object with the arguments of the call");
        Self {
            id: ComponentId::new(),
            name: name.into(),
            planner: planner.with_parser(Arc::new(parser)),
            tools: ToolSet::new(),
            max_steps: 10,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Stop before the next planner call once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn planner(&self) -> &Generator {
        &self.planner
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Planner kwargs for the next step, or `None` when the run is over.
    fn next_prompt(&self, input: &PromptKwargs, output: &RunnerOutput) -> Result<Option<PromptKwargs>> {
        if output.is_finished() || output.steps.len() >= self.max_steps {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut kwargs = input.clone();
        kwargs.insert("tools".to_string(), Arg::from(self.tools.describe()));
        kwargs.insert("step_history".to_string(), Arg::from(render_history(&output.steps)));
        Ok(Some(kwargs))
    }

    /// Execute the planner's call and record it as the next step.
    async fn advance(&self, output: &mut RunnerOutput, planned: &GeneratorOutput) -> Result<()> {
        let step = output.steps.len();
        if let Some(error) = &planned.error {
            return Err(Error::agent(step, format!("planner failed: {}", error)));
        }
        let data = planned
            .data
            .clone()
            .ok_or_else(|| Error::agent(step, "planner returned no function call"))?;
        let action: FunctionCall = serde_json::from_value(data)
            .map_err(|e| Error::agent(step, format!("invalid function call: {}", e)))?;

        if action.name == FINISH {
            let answer = action.args.get("answer").cloned().unwrap_or(Value::Null);
            debug!(runner = %self.name, step, "finish called");
            output.answer = Some(answer.clone());
            output.steps.push(StepOutput {
                step,
                action,
                observation: answer,
            });
            return Ok(());
        }

        let tool = self
            .tools
            .get(&action.name)
            .ok_or_else(|| Error::agent(step, format!("unknown tool '{}'", action.name)))?;
        let observation = tool.call(&action.args).await.map_err(|e| {
            if e.is_sample_level() {
                Error::agent(step, format!("tool '{}' failed: {}", action.name, e))
            } else {
                e
            }
        })?;
        debug!(runner = %self.name, step, tool = %action.name, "tool executed");
        output.steps.push(StepOutput {
            step,
            action,
            observation,
        });
        Ok(())
    }
}

fn render_history(steps: &[StepOutput]) -> String {
    steps
        .iter()
        .map(|s| {
            format!(
                "step {}: {}({}) -> {}",
                s.step,
                s.action.name,
                s.action.args,
                value_text(&s.observation)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl GradComponent for Runner {
    type Input = PromptKwargs;
    type Output = RunnerOutput;

    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, run: &Run, input: PromptKwargs) -> Result<RunnerOutput> {
        run.expect_mode(Mode::Inference, &self.name)?;
        let mut output = RunnerOutput::default();
        while let Some(kwargs) = self.next_prompt(&input, &output)? {
            let planned = self.planner.call(run, kwargs).await?;
            self.advance(&mut output, &planned).await?;
        }
        info!(
            runner = %self.name,
            steps = output.steps.len(),
            finished = output.is_finished(),
            "agent run finished"
        );
        Ok(output)
    }

    async fn forward(&self, run: &mut Run, input: PromptKwargs) -> Result<ParamId> {
        run.expect_mode(Mode::Training, &self.name)?;
        let mut output = RunnerOutput::default();
        let mut planned_nodes = Vec::new();
        while let Some(kwargs) = self.next_prompt(&input, &output)? {
            let node = self.planner.forward(run, kwargs).await?;
            let planned = run
                .graph()
                .get(node)?
                .full_response()
                .cloned()
                .unwrap_or_default();
            planned_nodes.push(node);
            self.advance(&mut output, &planned).await?;
        }

        let graph = run.graph_mut();
        let name = graph.unique_name(&format!("{}_output", self.name));
        graph.add(
            Parameter::output(name, serde_json::to_value(&output)?)
                .with_role_desc(format!("Step history and answer of {}", self.name))
                .with_predecessors(planned_nodes)
                .with_grad_fn(Arc::new(StepRelay)),
        )
    }

    fn parameters(&self) -> Vec<SharedParameter> {
        self.planner.parameters()
    }

    async fn set_teacher(&self, teacher: Option<ModelConfig>) {
        self.planner.set_teacher(teacher).await;
    }

    async fn validate(&self) -> Result<()> {
        if self.tools.get(FINISH).is_some() {
            return Err(Error::Config(format!(
                "runner '{}': tool name '{}' is reserved",
                self.name, FINISH
            )));
        }
        self.planner.validate().await
    }
}

/// Backward step of a run output: every planner step receives the feedback
/// the run output collected.
struct StepRelay;

#[async_trait]
impl BackwardFn for StepRelay {
    async fn backward(
        &self,
        _engine: &BackwardEngine,
        graph: &Graph,
        output: ParamId,
    ) -> Result<Vec<(ParamId, Feedback)>> {
        let out = graph.get(output)?;
        let mut updates = Vec::new();
        for &pred in out.predecessors() {
            for feedback in out.feedback() {
                updates.push((
                    pred,
                    Feedback::new(&out.name, feedback.text.clone()).with_score(feedback.score),
                ));
            }
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelKwargs, RetryPolicy};
    use crate::testing::ScriptedClient;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ADD: &str = r#"{"name": "add", "args": {"a": 1, "b": 2}}"#;
    const FINISH_TOTAL: &str = r#"{"name": "finish", "args": {"answer": {"total": 3}}}"#;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Total {
        total: i64,
    }

    struct Add;

    #[async_trait]
    impl Tool for Add {
        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "adds the integers a and b"
        }

        async fn call(&self, args: &Value) -> Result<Value> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    struct Unconfigured;

    #[async_trait]
    impl Tool for Unconfigured {
        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "needs an API key"
        }

        async fn call(&self, _args: &Value) -> Result<Value> {
            Err(Error::Config("calculator API key not set".to_string()))
        }
    }

    /// Planner that adds once, then finishes with the sum.
    fn add_then_finish() -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::responding(|request| {
            let reply = if request.prompt_text().contains("step 0: add") {
                FINISH_TOTAL
            } else {
                ADD
            };
            reply.to_string()
        }))
    }

    fn runner(client: Arc<ScriptedClient>) -> Runner {
        let planner = Generator::new("planner", "Solve the task with the tools.")
            .with_model(ModelConfig::new(client, ModelKwargs::new()))
            .with_retry(RetryPolicy::none());
        Runner::new("agent", planner).with_tool(Arc::new(Add))
    }

    fn task() -> PromptKwargs {
        PromptKwargs::from([("task".to_string(), Arg::from("What is 1 + 2?"))])
    }

    #[tokio::test]
    async fn test_tool_step_then_finish() {
        let client = add_then_finish();
        let output = runner(client.clone())
            .call(&Run::inference(), task())
            .await
            .unwrap();

        assert_eq!(output.steps.len(), 2);
        assert_eq!(output.steps[0].action.name, "add");
        assert_eq!(output.steps[0].observation, json!(3));
        assert_eq!(output.answer_as::<Total>().unwrap(), Some(Total { total: 3 }));

        let first = client.requests()[0].prompt_text();
        assert!(first.contains("- add: adds the integers a and b"));
        let second = client.requests()[1].prompt_text();
        assert!(second.contains(r#"step 0: add({"a":1,"b":2}) -> 3"#));
    }

    #[tokio::test]
    async fn test_step_budget_bounds_run() {
        let client = Arc::new(ScriptedClient::replying(ADD));
        let output = runner(client.clone())
            .with_max_steps(3)
            .call(&Run::inference(), task())
            .await
            .unwrap();

        assert_eq!(output.steps.len(), 3);
        assert!(!output.is_finished());
        assert_eq!(output.answer_as::<Total>().unwrap(), None);
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_plans_fail_the_step() {
        let unknown = runner(Arc::new(ScriptedClient::replying(
            r#"{"name": "search", "args": {}}"#,
        )));
        let err = unknown.call(&Run::inference(), task()).await.unwrap_err();
        assert!(matches!(err, Error::Agent { step: 0, .. }));
        assert!(err.to_string().contains("unknown tool 'search'"));

        let unparseable = runner(Arc::new(ScriptedClient::replying("let me think")));
        let err = unparseable.call(&Run::inference(), task()).await.unwrap_err();
        assert!(matches!(err, Error::Agent { step: 0, .. }));
        assert!(err.is_sample_level());
    }

    #[tokio::test]
    async fn test_tool_config_error_passes_through() {
        let planner = Generator::new("planner", "Solve.")
            .with_model(ModelConfig::new(
                Arc::new(ScriptedClient::replying(ADD)),
                ModelKwargs::new(),
            ))
            .with_retry(RetryPolicy::none());
        let runner = Runner::new("agent", planner).with_tool(Arc::new(Unconfigured));
        let err = runner.call(&Run::inference(), task()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_runner_stops_before_planning() {
        let client = add_then_finish();
        let token = CancelToken::new();
        token.cancel();
        let runner = runner(client.clone()).with_cancel_token(token);

        let err = runner.call(&Run::inference(), task()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(client.requests().is_empty());
    }

    #[test]
    fn test_answer_cast_mismatch() {
        let output = RunnerOutput {
            steps: Vec::new(),
            answer: Some(json!("three")),
        };
        assert!(matches!(
            output.answer_as::<Total>(),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_name_is_reserved() {
        struct Finish;

        #[async_trait]
        impl Tool for Finish {
            fn name(&self) -> &str {
                FINISH
            }

            fn description(&self) -> &str {
                "shadows the built-in"
            }

            async fn call(&self, args: &Value) -> Result<Value> {
                Ok(args.clone())
            }
        }

        let runner = runner(add_then_finish()).with_tool(Arc::new(Finish));
        assert!(matches!(runner.validate().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_forward_matches_call_and_relays_feedback() {
        let called = runner(add_then_finish())
            .call(&Run::inference(), task())
            .await
            .unwrap();

        let agent = runner(add_then_finish());
        let mut run = Run::training();
        let out = agent.forward(&mut run, task()).await.unwrap();
        let node = run.graph().get(out).unwrap();
        assert_eq!(node.data(), &serde_json::to_value(&called).unwrap());
        assert_eq!(node.predecessors().len(), 2);

        let graph = run.graph_mut();
        graph
            .add_feedback(out, Feedback::new("loss", "total should be 4").with_score(Some(0.0)))
            .unwrap();
        let engine_client = Arc::new(ScriptedClient::replying("Check the operands."));
        let engine = BackwardEngine::new(ModelConfig::new(engine_client, ModelKwargs::new()))
            .with_retry(RetryPolicy::none());
        graph.backward(out, &engine).await.unwrap();

        let feedback = graph.attached_feedback();
        assert_eq!(feedback["planner_instruction"].len(), 2);
        assert_eq!(feedback["planner_instruction"][0].text, "Check the operands.");
        assert_eq!(feedback["planner_few_shot_demos"].len(), 2);
    }

    #[tokio::test]
    async fn test_mode_exclusivity() {
        let agent = runner(add_then_finish());
        assert!(matches!(
            agent.call(&Run::training(), task()).await,
            Err(Error::InvalidMode { .. })
        ));
        assert!(matches!(
            agent.forward(&mut Run::inference(), task()).await,
            Err(Error::InvalidMode { .. })
        ));
    }
}
