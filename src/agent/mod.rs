//! Tool-calling agent loop.
//!
//! The loop speaks a small JSON action protocol with the model:
//!
//! ```text
//! {"kind": "tool_call", "toolName": "read_episode_context", "toolInput": {}}
//! {"kind": "final", "final": {"proceed": true}}
//! ```
//!
//! Native provider tool calls are accepted as well and take priority over
//! the text content. Every step is recorded in an [`AgentTrace`], which is
//! returned on success and attached to [`AgentLoopFailure`] on error.

pub mod json_loop;
pub mod tools;
pub mod trace;

pub use json_loop::{
    AgentError, AgentLoop, AgentLoopConfig, AgentLoopFailure, FallbackFn, FallbackOutcome,
    LoopOutcome, ModelCaller, ModelResponse, ProviderModelCaller, StepContext, ToolCall,
    DEFAULT_MAX_STEPS, DEFAULT_STEP_TIMEOUT, DEFAULT_TOTAL_TIMEOUT,
};
pub use tools::{FnTool, Tool, ToolContext, ToolError, ToolRegistry};
pub use trace::{AgentStepSummary, AgentTrace, ExecutionMode, StepKind, ToolCallRecord, TraceStep};
