//! JSON tool-calling loop.
//!
//! Each step:
//! 1. Calls the model with the conversation so far
//! 2. Executes requested tools and feeds their output back
//! 3. Or validates a terminal answer and stops
//!
//! A failing step ends the loop. When a fallback is supplied and enabled it
//! produces the final value instead and the outcome is reported as legacy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::tools::{ToolContext, ToolError, ToolRegistry};
use super::trace::{AgentTrace, ExecutionMode, StepKind, ToolCallRecord, TraceStep};
use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmProvider, Message, Usage};
use crate::utils::extract_json_object;

/// Default maximum number of steps.
pub const DEFAULT_MAX_STEPS: usize = 6;
/// Default per-step budget for a model or tool call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_millis(45_000);
/// Default wall-clock budget for the whole loop.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_millis(180_000);

/// Errors that end an agent loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed at step {step}: {source}")]
    Model {
        step: usize,
        #[source]
        source: LlmError,
    },

    #[error("model step timeout ({timeout_ms}ms) at step={step}")]
    ModelTimeout { step: usize, timeout_ms: u64 },

    #[error("tool timeout ({timeout_ms}ms) at step={step} tool={tool}")]
    ToolTimeout {
        step: usize,
        tool: String,
        timeout_ms: u64,
    },

    #[error("tool '{tool}' failed at step {step}: {source}")]
    Tool {
        step: usize,
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid action at step {step}: {reason}")]
    InvalidAction { step: usize, reason: String },

    #[error("invalid final value at step {step}: {reason}")]
    InvalidFinal { step: usize, reason: String },

    #[error("reached max steps ({max_steps})")]
    StepLimitExceeded { max_steps: usize },

    #[error("total timeout exceeded ({timeout_ms}ms)")]
    TotalTimeout { timeout_ms: u64 },

    #[error("fallback timeout ({timeout_ms}ms)")]
    FallbackTimeout { timeout_ms: u64 },

    #[error("fallback failed: {0}")]
    Fallback(String),
}

/// An agent loop error together with the trace recorded up to the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AgentLoopFailure {
    pub error: AgentError,
    pub trace: AgentTrace,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// What the model returned for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    /// Native tool calls. When non-empty they take priority over `content`.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl ModelResponse {
    /// A text-only response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Attach a native tool call.
    pub fn with_tool_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ToolCall {
            name: name.into(),
            input,
        });
        self
    }
}

/// Per-call context handed to the model caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    /// 1-based step index.
    pub step_index: usize,
}

/// The model seam of the agent loop.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(&self, messages: &[Message], ctx: StepContext)
        -> Result<ModelResponse, LlmError>;
}

/// Adapts an [`LlmProvider`] into a [`ModelCaller`].
pub struct ProviderModelCaller {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

impl ProviderModelCaller {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl ModelCaller for ProviderModelCaller {
    async fn call(
        &self,
        messages: &[Message],
        _ctx: StepContext,
    ) -> Result<ModelResponse, LlmError> {
        let mut request = GenerationRequest::new(self.model.clone(), messages.to_vec());
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.max_tokens {
            request = request.with_max_tokens(m);
        }

        let response = self.provider.generate(request).await?;
        Ok(ModelResponse {
            content: response.content,
            tool_calls: response
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    name: call.name,
                    input: call.arguments,
                })
                .collect(),
            usage: response.usage,
        })
    }
}

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_steps: usize,
    pub step_timeout: Duration,
    pub total_timeout: Duration,
    pub fallback_enabled: bool,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            fallback_enabled: true,
        }
    }
}

impl AgentLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of steps. Zero keeps the default.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        if max_steps > 0 {
            self.max_steps = max_steps;
        }
        self
    }

    /// Set the per-step budget. Zero keeps the default.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.step_timeout = timeout;
        }
        self
    }

    /// Set the whole-loop budget. Zero keeps the default.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.total_timeout = timeout;
        }
        self
    }

    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }
}

/// Final value produced by a fallback, with an optional human-readable reason.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub reason: Option<String>,
}

impl<T> FallbackOutcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Deterministic path invoked with the error that ended the loop.
pub type FallbackFn<'a, T> = Box<
    dyn FnOnce(&AgentError) -> BoxFuture<'a, Result<FallbackOutcome<T>, AgentError>> + Send + 'a,
>;

/// Successful outcome of an agent loop, in either mode.
#[derive(Debug, Clone)]
pub struct LoopOutcome<T> {
    pub value: T,
    pub execution_mode: ExecutionMode,
    pub fallback_used: bool,
    pub trace: AgentTrace,
}

/// Parsed action from model text.
enum Action {
    Tools(Vec<ToolCall>),
    Final(Value),
}

fn parse_action(content: &str) -> Result<Action, String> {
    let value = extract_json_object(content).map_err(|e| e.to_string())?;
    match value.get("kind").and_then(Value::as_str) {
        Some("tool_call") => {
            let name = value
                .get("toolName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| "tool_call action requires a non-empty toolName".to_string())?;
            let input = value.get("toolInput").cloned().unwrap_or_else(|| json!({}));
            Ok(Action::Tools(vec![ToolCall {
                name: name.to_string(),
                input,
            }]))
        }
        Some("final") => Ok(Action::Final(
            value.get("final").cloned().unwrap_or(Value::Null),
        )),
        Some(other) => Err(format!("unknown action kind '{other}'")),
        None => Err("action is missing 'kind'".to_string()),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Accumulates trace steps for one run.
struct TraceBuilder {
    started_at: DateTime<Utc>,
    started: Instant,
    steps: Vec<TraceStep>,
    usage: Usage,
}

struct StepDraft {
    index: usize,
    started_at: DateTime<Utc>,
    started: Instant,
    model_output: Option<String>,
    tool_calls: Vec<ToolCallRecord>,
}

impl StepDraft {
    fn new(index: usize) -> Self {
        Self {
            index,
            started_at: Utc::now(),
            started: Instant::now(),
            model_output: None,
            tool_calls: Vec::new(),
        }
    }

    fn finish(self, kind: StepKind, final_value: Option<Value>, error: Option<String>) -> TraceStep {
        TraceStep {
            index: self.index,
            kind,
            tool_name: self.tool_calls.first().map(|c| c.name.clone()),
            tool_calls: self.tool_calls,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: millis(self.started.elapsed()),
            model_output: self.model_output,
            final_value,
            error,
        }
    }
}

impl TraceBuilder {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            steps: Vec::new(),
            usage: Usage::default(),
        }
    }

    fn build(&self, mode: ExecutionMode, fallback_reason: Option<String>) -> AgentTrace {
        AgentTrace {
            execution_mode: mode,
            fallback_used: mode == ExecutionMode::Legacy,
            fallback_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_duration_ms: millis(self.started.elapsed()),
            steps: self.steps.clone(),
            token_usage: self.usage,
        }
    }
}

/// Drives one model conversation to a validated final value.
pub struct AgentLoop {
    model: Arc<dyn ModelCaller>,
    tools: ToolRegistry,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn ModelCaller>, tools: ToolRegistry, config: AgentLoopConfig) -> Self {
        Self {
            model,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    /// Run the loop.
    ///
    /// `parse_final` validates the model's terminal answer. `fallback` is
    /// only consulted when the loop fails and fallback is enabled; without
    /// one the original error is returned.
    pub async fn run<'f, T, P>(
        &self,
        initial_messages: Vec<Message>,
        parse_final: P,
        fallback: Option<FallbackFn<'f, T>>,
    ) -> Result<LoopOutcome<T>, AgentLoopFailure>
    where
        T: Send,
        P: Fn(Value) -> Result<T, String> + Send + Sync,
    {
        let mut trace = TraceBuilder::new();

        let error = match self.run_steps(initial_messages, &parse_final, &mut trace).await {
            Ok(value) => {
                return Ok(LoopOutcome {
                    value,
                    execution_mode: ExecutionMode::Agent,
                    fallback_used: false,
                    trace: trace.build(ExecutionMode::Agent, None),
                })
            }
            Err(error) => error,
        };

        let fallback = match fallback {
            Some(f) if self.config.fallback_enabled => f,
            _ => {
                return Err(AgentLoopFailure {
                    error,
                    trace: trace.build(ExecutionMode::Agent, None),
                })
            }
        };

        tracing::warn!(error = %error, steps = trace.steps.len(), "Agent loop failed, using fallback");

        let budget = self.config.step_timeout;
        let outcome = match tokio::time::timeout(budget, fallback(&error)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(fallback_error)) => {
                return Err(AgentLoopFailure {
                    error: fallback_error,
                    trace: trace.build(ExecutionMode::Agent, None),
                })
            }
            Err(_) => {
                return Err(AgentLoopFailure {
                    error: AgentError::FallbackTimeout {
                        timeout_ms: millis(budget),
                    },
                    trace: trace.build(ExecutionMode::Agent, None),
                })
            }
        };

        let reason = outcome.reason.unwrap_or_else(|| error.to_string());
        Ok(LoopOutcome {
            value: outcome.value,
            execution_mode: ExecutionMode::Legacy,
            fallback_used: true,
            trace: trace.build(ExecutionMode::Legacy, Some(reason)),
        })
    }

    fn step_budget(&self, trace: &TraceBuilder) -> (Duration, bool) {
        let remaining = self
            .config
            .total_timeout
            .saturating_sub(trace.started.elapsed());
        if remaining < self.config.step_timeout {
            (remaining, true)
        } else {
            (self.config.step_timeout, false)
        }
    }

    fn timeout_error(&self, step: usize, limited_by_total: bool) -> AgentError {
        if limited_by_total {
            AgentError::TotalTimeout {
                timeout_ms: millis(self.config.total_timeout),
            }
        } else {
            AgentError::ModelTimeout {
                step,
                timeout_ms: millis(self.config.step_timeout),
            }
        }
    }

    async fn run_steps<T, P>(
        &self,
        mut messages: Vec<Message>,
        parse_final: &P,
        trace: &mut TraceBuilder,
    ) -> Result<T, AgentError>
    where
        P: Fn(Value) -> Result<T, String>,
    {
        for step_index in 1..=self.config.max_steps {
            if trace.started.elapsed() > self.config.total_timeout {
                return Err(AgentError::TotalTimeout {
                    timeout_ms: millis(self.config.total_timeout),
                });
            }

            let mut draft = StepDraft::new(step_index);
            let ctx = StepContext { step_index };

            let (budget, by_total) = self.step_budget(trace);
            let response = match tokio::time::timeout(budget, self.model.call(&messages, ctx)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => {
                    let error = AgentError::Model {
                        step: step_index,
                        source,
                    };
                    trace
                        .steps
                        .push(draft.finish(StepKind::ModelCall, None, Some(error.to_string())));
                    return Err(error);
                }
                Err(_) => {
                    let error = self.timeout_error(step_index, by_total);
                    trace
                        .steps
                        .push(draft.finish(StepKind::ModelCall, None, Some(error.to_string())));
                    return Err(error);
                }
            };

            trace.usage = trace.usage.merge(response.usage);
            draft.model_output = Some(response.content.clone());

            let action = if response.tool_calls.is_empty() {
                match parse_action(&response.content) {
                    Ok(action) => action,
                    Err(reason) => {
                        let error = AgentError::InvalidAction {
                            step: step_index,
                            reason,
                        };
                        trace
                            .steps
                            .push(draft.finish(StepKind::ModelCall, None, Some(error.to_string())));
                        return Err(error);
                    }
                }
            } else {
                Action::Tools(response.tool_calls.clone())
            };

            let calls = match action {
                Action::Final(value) => {
                    return match parse_final(value.clone()) {
                        Ok(parsed) => {
                            tracing::debug!(step = step_index, "Agent produced final answer");
                            trace
                                .steps
                                .push(draft.finish(StepKind::Final, Some(value), None));
                            Ok(parsed)
                        }
                        Err(reason) => {
                            let error = AgentError::InvalidFinal {
                                step: step_index,
                                reason,
                            };
                            trace.steps.push(draft.finish(
                                StepKind::Final,
                                Some(value),
                                Some(error.to_string()),
                            ));
                            Err(error)
                        }
                    };
                }
                Action::Tools(calls) => calls,
            };

            let echo = if response.content.trim().is_empty() {
                serde_json::to_string(&calls).unwrap_or_default()
            } else {
                response.content.clone()
            };
            messages.push(Message::assistant(echo));

            for call in calls {
                tracing::debug!(step = step_index, tool = %call.name, "Agent tool call");
                let tool_ctx = ToolContext {
                    step_index,
                    messages: messages.clone(),
                };

                let result = match self.tools.get(&call.name) {
                    None => Err(AgentError::UnknownTool(call.name.clone())),
                    Some(tool) => {
                        let (budget, by_total) = self.step_budget(trace);
                        match tokio::time::timeout(budget, tool.execute(call.input.clone(), &tool_ctx))
                            .await
                        {
                            Ok(Ok(output)) => Ok(output),
                            Ok(Err(source)) => Err(AgentError::Tool {
                                step: step_index,
                                tool: call.name.clone(),
                                source,
                            }),
                            Err(_) if by_total => Err(AgentError::TotalTimeout {
                                timeout_ms: millis(self.config.total_timeout),
                            }),
                            Err(_) => Err(AgentError::ToolTimeout {
                                step: step_index,
                                tool: call.name.clone(),
                                timeout_ms: millis(self.config.step_timeout),
                            }),
                        }
                    }
                };

                match result {
                    Ok(output) => {
                        messages.push(Message::user(
                            json!({"toolResult": {"toolName": call.name, "output": output}})
                                .to_string(),
                        ));
                        draft.tool_calls.push(ToolCallRecord {
                            name: call.name,
                            input: Some(call.input),
                            output: Some(output),
                            error: None,
                        });
                    }
                    Err(error) => {
                        draft.tool_calls.push(ToolCallRecord {
                            name: call.name,
                            input: Some(call.input),
                            output: None,
                            error: Some(error.to_string()),
                        });
                        trace
                            .steps
                            .push(draft.finish(StepKind::ToolCall, None, Some(error.to_string())));
                        return Err(error);
                    }
                }
            }

            trace
                .steps
                .push(draft.finish(StepKind::ToolCall, None, None));
        }

        Err(AgentError::StepLimitExceeded {
            max_steps: self.config.max_steps,
        })
    }
}
