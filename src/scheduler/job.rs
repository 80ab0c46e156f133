//! Job definitions for the scheduler.
//!
//! - `Job`: a queued unit of work and its recorded outcome
//! - `JobKind`: which handler runs the job
//! - `JobStatus`: lifecycle state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::progress::JobProgress;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Parse a status name. Unrecognised names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One chunk of the episode creation pipeline.
    RunEpisodeCreationAgent,
    /// Full refinement of a single scene.
    RefineSceneAll,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RunEpisodeCreationAgent => "run_episode_creation_agent",
            JobKind::RefineSceneAll => "refine_scene_all",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "run_episode_creation_agent" => Some(JobKind::RunEpisodeCreationAgent),
            "refine_scene_all" => Some(JobKind::RefineSceneAll),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Kind-specific input.
    pub payload: Value,
    /// Episode this job belongs to, taken from `payload.episodeId`.
    #[serde(default)]
    pub episode_id: Option<String>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a queued job with a fresh UUID.
    pub fn new(kind: JobKind, payload: Value) -> Self {
        let now = Utc::now();
        let episode_id = payload
            .get("episodeId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Queued,
            payload,
            episode_id,
            progress: None,
            error: None,
            result: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to running and count the attempt.
    pub fn start(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Record a terminal outcome.
    pub fn finish(&mut self, outcome: JobOutcome) {
        let now = Utc::now();
        match outcome {
            JobOutcome::Succeeded(result) => {
                self.status = JobStatus::Succeeded;
                self.result = Some(result);
                self.error = None;
            }
            JobOutcome::Failed(error) => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
            }
            JobOutcome::Cancelled => {
                self.status = JobStatus::Cancelled;
            }
        }
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Terminal outcome written back to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(String),
    Cancelled,
}
