//! Run accumulators and the run result.

use serde::{Deserialize, Serialize};

use crate::agent::{AgentStepSummary, AgentTrace, ExecutionMode};
use crate::scheduler::JobStatus;

/// Maximum length of a summarized error message before the ellipsis.
pub const ERROR_SUMMARY_LIMIT: usize = 220;

/// The five fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CoreExpression,
    SceneScript,
    SceneList,
    SceneRefinement,
    SoundAndDuration,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::CoreExpression,
        Stage::SceneScript,
        Stage::SceneList,
        Stage::SceneRefinement,
        Stage::SoundAndDuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CoreExpression => "core_expression",
            Stage::SceneScript => "scene_script",
            Stage::SceneList => "scene_list",
            Stage::SceneRefinement => "scene_refinement",
            Stage::SoundAndDuration => "sound_and_duration",
        }
    }

    /// Display title used in progress messages.
    pub fn title(&self) -> &'static str {
        match self {
            Stage::CoreExpression => "Core expression",
            Stage::SceneScript => "Scene script",
            Stage::SceneList => "Scene list",
            Stage::SceneRefinement => "Scene refinement",
            Stage::SoundAndDuration => "Sound and duration",
        }
    }

    /// `(base, span)` of the stage's slice of overall run progress.
    pub fn progress_slice(&self) -> (u8, u8) {
        match self {
            Stage::CoreExpression => (12, 16),
            Stage::SceneScript => (28, 16),
            Stage::SceneList => (44, 16),
            Stage::SceneRefinement => (60, 20),
            Stage::SoundAndDuration => (80, 18),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one stage within one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub step: Stage,
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    pub chunk: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<String>,
}

/// Status of a scene child job as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildTaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Missing from the job store, or in an unrecognised state.
    Unknown,
}

impl From<JobStatus> for ChildTaskStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => ChildTaskStatus::Queued,
            JobStatus::Running => ChildTaskStatus::Running,
            JobStatus::Succeeded => ChildTaskStatus::Succeeded,
            JobStatus::Failed => ChildTaskStatus::Failed,
            JobStatus::Cancelled => ChildTaskStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for ChildTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChildTaskStatus::Queued => "queued",
            ChildTaskStatus::Running => "running",
            ChildTaskStatus::Succeeded => "succeeded",
            ChildTaskStatus::Failed => "failed",
            ChildTaskStatus::Cancelled => "cancelled",
            ChildTaskStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One dispatched per-scene child job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneChildTask {
    pub scene_id: String,
    pub order: u32,
    pub job_id: String,
    pub status: ChildTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub chunk: u32,
}

/// Counts of child tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneChildStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SceneChildStats {
    pub fn from_tasks(tasks: &[SceneChildTask]) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                ChildTaskStatus::Queued => stats.queued += 1,
                ChildTaskStatus::Running => stats.running += 1,
                ChildTaskStatus::Succeeded => stats.succeeded += 1,
                ChildTaskStatus::Failed => stats.failed += 1,
                ChildTaskStatus::Cancelled => stats.cancelled += 1,
                ChildTaskStatus::Unknown => {}
            }
        }
        stats
    }
}

/// Result of one orchestrator invocation (one chunk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRunResult {
    pub project_id: String,
    pub episode_id: String,
    pub chunk: u32,
    pub execution_mode: ExecutionMode,
    pub fallback_used: bool,
    pub agent_trace: Option<AgentTrace>,
    pub step_summaries: Vec<StepSummary>,
    pub scene_child_tasks: Vec<SceneChildTask>,
    pub agent_steps: Vec<AgentStepSummary>,
    /// True iff a continuation job was enqueued; `next_job_id` is then set.
    pub continued: bool,
    pub next_job_id: Option<String>,
}

/// Collapse whitespace and bound an error message for summaries.
pub fn summarize_error(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "unknown error".to_string();
    }
    if collapsed.chars().count() <= ERROR_SUMMARY_LIMIT {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(ERROR_SUMMARY_LIMIT).collect();
    format!("{}...", truncated)
}
