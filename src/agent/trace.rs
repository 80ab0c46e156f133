//! Step trace produced by one agent loop invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Usage;

/// Whether a result came from the tool-calling loop or the deterministic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Agent,
    Legacy,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Agent => write!(f, "agent"),
            ExecutionMode::Legacy => write!(f, "legacy"),
        }
    }
}

/// Kind of a trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// The step ended inside or right after the model call.
    ModelCall,
    /// The model requested one or more tools.
    ToolCall,
    /// The model produced a terminal answer.
    Final,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::ModelCall => write!(f, "model_call"),
            StepKind::ToolCall => write!(f, "tool_call"),
            StepKind::Final => write!(f, "final"),
        }
    }
}

/// One tool invocation within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One iteration of the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    /// 1-based step index.
    pub index: usize,
    pub kind: StepKind,
    /// Name of the first tool called in this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_value: Option<Value>,
    /// Set when this step ended the loop in failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Short `{index, kind, summary}` view of a trace step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStepSummary {
    pub index: usize,
    pub kind: StepKind,
    pub summary: String,
}

/// Complete record of an agent loop invocation. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTrace {
    pub execution_mode: ExecutionMode,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub steps: Vec<TraceStep>,
    #[serde(default)]
    pub token_usage: Usage,
}

impl AgentTrace {
    /// One summary per step, e.g. `tool_call:read_episode_context`.
    pub fn step_summaries(&self) -> Vec<AgentStepSummary> {
        self.steps
            .iter()
            .map(|step| AgentStepSummary {
                index: step.index,
                kind: step.kind,
                summary: match &step.tool_name {
                    Some(tool) => format!("{}:{}", step.kind, tool),
                    None => step.kind.to_string(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, kind: StepKind, tool: Option<&str>) -> TraceStep {
        let now = Utc::now();
        TraceStep {
            index,
            kind,
            tool_name: tool.map(str::to_string),
            tool_calls: vec![],
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            model_output: None,
            final_value: None,
            error: None,
        }
    }

    #[test]
    fn test_step_summaries() {
        let now = Utc::now();
        let trace = AgentTrace {
            execution_mode: ExecutionMode::Agent,
            fallback_used: false,
            fallback_reason: None,
            started_at: now,
            finished_at: now,
            total_duration_ms: 5,
            steps: vec![
                step(1, StepKind::ToolCall, Some("read_episode_context")),
                step(2, StepKind::Final, None),
            ],
            token_usage: Usage::default(),
        };

        let summaries = trace.step_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].summary, "tool_call:read_episode_context");
        assert_eq!(summaries[1].summary, "final");
    }

    #[test]
    fn test_mode_and_kind_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(ExecutionMode::Legacy).expect("serializes"),
            "legacy"
        );
        assert_eq!(
            serde_json::to_value(StepKind::ModelCall).expect("serializes"),
            "model_call"
        );
    }
}
