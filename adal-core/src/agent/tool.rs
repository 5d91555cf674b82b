//! Tools an agent planner can call.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

/// A named function the planner may call with JSON arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// One line shown to the planner next to the tool name.
    fn description(&self) -> &str;

    async fn call(&self, args: &Value) -> Result<Value>;
}

/// Tools available to a [`Runner`](super::Runner), keyed by name.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`, returning the tool it replaced under the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool list rendered for the planner prompt, ending with `finish`.
    pub fn describe(&self) -> String {
        let mut lines: Vec<String> = self
            .tools
            .values()
            .map(|tool| format!("- {}: {}", tool.name(), tool.description()))
            .collect();
        lines.push(format!(
            "- {}: end the task; args: {{\"answer\": <final answer>}}",
            super::FINISH
        ));
        lines.join("\n")
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet").field("tools", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "returns its arguments"
        }

        async fn call(&self, args: &Value) -> Result<Value> {
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let mut tools = ToolSet::new();
        assert!(tools.register(Arc::new(Echo("echo"))).is_none());
        assert!(tools.register(Arc::new(Echo("echo"))).is_some());
        assert_eq!(tools.len(), 1);

        let echoed = tools.get("echo").unwrap().call(&json!({"x": 1})).await.unwrap();
        assert_eq!(echoed, json!({"x": 1}));
        assert!(tools.get("missing").is_none());
    }

    #[test]
    fn test_describe_lists_tools_then_finish() {
        let mut tools = ToolSet::new();
        tools.register(Arc::new(Echo("search")));
        tools.register(Arc::new(Echo("lookup")));
        let text = tools.describe();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "- lookup: returns its arguments");
        assert_eq!(lines[1], "- search: returns its arguments");
        assert!(lines[2].starts_with("- finish:"));
    }
}
