//! Tool definitions and registry for the agent loop.
//!
//! A registry is assembled by the caller for each run; it is a plain
//! name-to-tool map with no control flow of its own.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::llm::Message;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Invalid input provided to the tool.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tool execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// What a tool sees about the loop that invoked it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// 1-based index of the step issuing the call.
    pub step_index: usize,
    /// Conversation so far, including the model output that requested the call.
    pub messages: Vec<Message>,
}

/// A tool the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to address the tool.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

type ToolFn = dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A tool backed by a closure.
///
/// ```ignore
/// let tool = FnTool::new("read_context", "Read the episode state", |_input, _ctx| {
///     Box::pin(async move { Ok(serde_json::json!({"sceneCount": 3})) })
/// });
/// ```
pub struct FnTool {
    name: String,
    description: String,
    run: Box<ToolFn>,
}

impl FnTool {
    /// Create a tool from a name, description and async closure.
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            run: Box::new(run),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        (self.run)(input, ctx.clone()).await
    }
}

/// Registry of tools available to one agent run.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Builder form of [`ToolRegistry::register`].
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `{name: description}` map, suitable for embedding in a prompt.
    pub fn describe(&self) -> Value {
        let map = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), Value::String(tool.description().to_string())))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(FnTool::new(name, format!("echo {name}"), |input, ctx| {
            Box::pin(async move { Ok(json!({"input": input, "step": ctx.step_index})) })
        }))
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = ToolRegistry::new()
            .with_tool(echo_tool("b"))
            .with_tool(echo_tool("a"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.describe()["b"], "echo b");
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("a"));
        registry.register(echo_tool("a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_fn_tool_execute() {
        let tool = echo_tool("echo");
        let ctx = ToolContext {
            step_index: 3,
            messages: vec![],
        };
        let out = tool.execute(json!({"x": 1}), &ctx).await.expect("tool runs");
        assert_eq!(out["input"]["x"], 1);
        assert_eq!(out["step"], 3);
    }
}
