//! Agent loop behaviour through the public API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use episode_forge::agent::{
    AgentError, AgentLoop, AgentLoopConfig, ExecutionMode, FallbackFn, FallbackOutcome, FnTool,
    ModelCaller, ModelResponse, StepContext, StepKind, ToolRegistry,
};
use episode_forge::llm::Message;
use episode_forge::LlmError;

/// Model that always fails.
struct BrokenModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelCaller for BrokenModel {
    async fn call(
        &self,
        _messages: &[Message],
        _ctx: StepContext,
    ) -> Result<ModelResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::RequestFailed("connection reset".into()))
    }
}

/// Model that replays a script, then sleeps for `stall` on every later call.
struct ScriptedModel {
    responses: Mutex<VecDeque<ModelResponse>>,
    stall: Duration,
}

impl ScriptedModel {
    fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            stall: Duration::from_secs(60),
        })
    }
}

#[async_trait]
impl ModelCaller for ScriptedModel {
    async fn call(
        &self,
        _messages: &[Message],
        _ctx: StepContext,
    ) -> Result<ModelResponse, LlmError> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => Ok(response),
            None => {
                tokio::time::sleep(self.stall).await;
                Err(LlmError::RequestFailed("stalled".into()))
            }
        }
    }
}

fn lookup_tool() -> ToolRegistry {
    ToolRegistry::new().with_tool(Arc::new(FnTool::new(
        "lookup",
        "Look up a value.",
        |input, _ctx| Box::pin(async move { Ok(json!({"echo": input})) }),
    )))
}

fn proceed(value: Value) -> Result<bool, String> {
    value
        .get("proceed")
        .and_then(Value::as_bool)
        .ok_or_else(|| "missing proceed".to_string())
}

fn tool_call_text() -> ModelResponse {
    ModelResponse::text(r#"{"kind":"tool_call","toolName":"lookup","toolInput":{"k":1}}"#)
}

#[tokio::test]
async fn test_broken_model_uses_fallback_value() {
    let model = Arc::new(BrokenModel {
        calls: AtomicUsize::new(0),
    });
    let agent = AgentLoop::new(model.clone(), lookup_tool(), AgentLoopConfig::default());
    let fallback: FallbackFn<'_, bool> = Box::new(|error| {
        let reason = format!("legacy after: {}", error);
        Box::pin(async move { Ok(FallbackOutcome::new(false).with_reason(reason)) })
    });

    let outcome = agent
        .run(vec![Message::user("go")], proceed, Some(fallback))
        .await
        .expect("fallback succeeds");

    assert_eq!(outcome.execution_mode, ExecutionMode::Legacy);
    assert!(outcome.fallback_used);
    assert!(!outcome.value);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.trace.steps.len(), 1);
    assert!(outcome
        .trace
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("connection reset"));
}

#[tokio::test]
async fn test_broken_model_without_fallback_propagates() {
    let model = Arc::new(BrokenModel {
        calls: AtomicUsize::new(0),
    });
    let agent = AgentLoop::new(
        model,
        lookup_tool(),
        AgentLoopConfig::default().with_fallback_enabled(false),
    );
    let fallback: FallbackFn<'_, bool> =
        Box::new(|_| Box::pin(async { Ok(FallbackOutcome::new(true)) }));

    let failure = agent
        .run(vec![Message::user("go")], proceed, Some(fallback))
        .await
        .expect_err("error propagates");

    assert!(matches!(failure.error, AgentError::Model { step: 1, .. }));
    assert_eq!(failure.trace.steps.len(), 1);
}

#[tokio::test]
async fn test_trace_counts_every_performed_step() {
    let model = ScriptedModel::new(vec![
        tool_call_text(),
        tool_call_text(),
        ModelResponse::text(r#"{"kind":"final","final":{"proceed":true}}"#),
    ]);
    let agent = AgentLoop::new(model, lookup_tool(), AgentLoopConfig::default());

    let outcome = agent
        .run(vec![Message::user("go")], proceed, None)
        .await
        .expect("agent finishes");

    assert_eq!(outcome.execution_mode, ExecutionMode::Agent);
    assert!(outcome.value);
    let kinds: Vec<_> = outcome.trace.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StepKind::ToolCall, StepKind::ToolCall, StepKind::Final]
    );
    let first_call = &outcome.trace.steps[0].tool_calls[0];
    assert_eq!(first_call.output, Some(json!({"echo": {"k": 1}})));
}

#[tokio::test]
async fn test_step_limit_counts_failing_step() {
    let model = ScriptedModel::new(vec![tool_call_text(), tool_call_text(), tool_call_text()]);
    let agent = AgentLoop::new(
        model,
        lookup_tool(),
        AgentLoopConfig::default()
            .with_max_steps(2)
            .with_fallback_enabled(false),
    );

    let failure = agent
        .run(vec![Message::user("go")], proceed, None)
        .await
        .expect_err("step limit");

    assert!(matches!(
        failure.error,
        AgentError::StepLimitExceeded { max_steps: 2 }
    ));
    assert_eq!(failure.trace.steps.len(), 2);
}

#[tokio::test]
async fn test_stalled_model_hits_step_timeout() {
    let model = ScriptedModel::new(vec![tool_call_text()]);
    let agent = AgentLoop::new(
        model,
        lookup_tool(),
        AgentLoopConfig::default()
            .with_step_timeout(Duration::from_millis(20))
            .with_fallback_enabled(false),
    );

    let failure = agent
        .run(vec![Message::user("go")], proceed, None)
        .await
        .expect_err("second step stalls");

    assert!(matches!(
        failure.error,
        AgentError::ModelTimeout { step: 2, .. }
    ));
    assert_eq!(failure.trace.steps.len(), 2);
    assert!(failure.trace.steps[1].error.is_some());
}

/// Model that asks for the `lookup` tool on every call after a short delay.
struct SlowToolCaller {
    delay: Duration,
}

#[async_trait]
impl ModelCaller for SlowToolCaller {
    async fn call(
        &self,
        _messages: &[Message],
        _ctx: StepContext,
    ) -> Result<ModelResponse, LlmError> {
        tokio::time::sleep(self.delay).await;
        Ok(tool_call_text())
    }
}

fn total_budget_config() -> AgentLoopConfig {
    AgentLoopConfig::default()
        .with_max_steps(50)
        .with_step_timeout(Duration::from_secs(1))
        .with_total_timeout(Duration::from_millis(100))
}

#[tokio::test]
async fn test_total_budget_ends_loop_without_fallback() {
    let model = Arc::new(SlowToolCaller {
        delay: Duration::from_millis(30),
    });
    let agent = AgentLoop::new(
        model,
        lookup_tool(),
        total_budget_config().with_fallback_enabled(false),
    );

    let failure = agent
        .run(vec![Message::user("go")], proceed, None)
        .await
        .expect_err("total budget runs out");

    assert!(matches!(
        failure.error,
        AgentError::TotalTimeout { timeout_ms: 100 }
    ));
    assert!(!failure.trace.steps.is_empty());
    assert!(failure.trace.steps.len() < 50);
}

#[tokio::test]
async fn test_total_budget_falls_back_to_legacy() {
    let model = Arc::new(SlowToolCaller {
        delay: Duration::from_millis(30),
    });
    let agent = AgentLoop::new(model, lookup_tool(), total_budget_config());
    let fallback: FallbackFn<'_, bool> =
        Box::new(|_| Box::pin(async { Ok(FallbackOutcome::new(false)) }));

    let outcome = agent
        .run(vec![Message::user("go")], proceed, Some(fallback))
        .await
        .expect("fallback succeeds");

    assert_eq!(outcome.execution_mode, ExecutionMode::Legacy);
    assert!(outcome.fallback_used);
    assert_eq!(
        outcome.trace.fallback_reason.as_deref(),
        Some("total timeout exceeded (100ms)")
    );
}

#[tokio::test]
async fn test_slow_tool_hits_tool_timeout() {
    let model = ScriptedModel::new(vec![ModelResponse::text(
        r#"{"kind":"tool_call","toolName":"render","toolInput":{}}"#,
    )]);
    let tools = ToolRegistry::new().with_tool(Arc::new(FnTool::new(
        "render",
        "Render a storyboard frame.",
        |_input, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            })
        },
    )));
    let agent = AgentLoop::new(
        model,
        tools,
        AgentLoopConfig::default()
            .with_step_timeout(Duration::from_millis(20))
            .with_fallback_enabled(false),
    );

    let failure = agent
        .run(vec![Message::user("go")], proceed, None)
        .await
        .expect_err("tool stalls");

    match &failure.error {
        AgentError::ToolTimeout {
            step,
            tool,
            timeout_ms,
        } => {
            assert_eq!(*step, 1);
            assert_eq!(tool, "render");
            assert_eq!(*timeout_ms, 20);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(failure.trace.steps.len(), 1);
    assert_eq!(failure.trace.steps[0].kind, StepKind::ToolCall);
    assert!(failure.trace.steps[0].tool_calls[0].error.is_some());
}

#[tokio::test]
async fn test_slow_fallback_times_out() {
    let model = Arc::new(BrokenModel {
        calls: AtomicUsize::new(0),
    });
    let agent = AgentLoop::new(
        model,
        lookup_tool(),
        AgentLoopConfig::default().with_step_timeout(Duration::from_millis(20)),
    );
    let fallback: FallbackFn<'_, bool> = Box::new(|_| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(FallbackOutcome::new(true))
        })
    });

    let failure = agent
        .run(vec![Message::user("go")], proceed, Some(fallback))
        .await
        .expect_err("fallback stalls");

    assert!(matches!(
        failure.error,
        AgentError::FallbackTimeout { timeout_ms: 20 }
    ));
    assert_eq!(failure.trace.steps.len(), 1);
}
