//! Job control seam.
//!
//! The orchestrator only needs a narrow view of the queue: enqueue work,
//! look up statuses, find a conflicting running job, and write progress and
//! outcomes for jobs it created or runs as. [`JobControl`] is that view.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::job::{Job, JobKind, JobOutcome, JobStatus};
use crate::progress::{JobProgress, ProgressSink};

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found in the store.
    #[error("Job {0} not found")]
    JobNotFound(String),
}

/// Status of one job as seen by a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusReport {
    pub job_id: String,
    /// `None` when the stored status is not a recognised state.
    pub status: Option<JobStatus>,
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: Some(job.status),
            error: job.error.clone(),
        }
    }
}

/// Narrow job-queue interface used by the orchestrator and its job handler.
#[async_trait]
pub trait JobControl: Send + Sync {
    /// Enqueue a new job and return its id.
    async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<String, QueueError>;

    /// Fetch a full job record.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Status of a single job, `None` if it does not exist.
    async fn get_status(&self, job_id: &str) -> Result<Option<JobStatusReport>, QueueError> {
        let mut reports = self.get_statuses(&[job_id.to_string()]).await?;
        Ok(reports.pop())
    }

    /// Statuses of the given jobs. Ids that do not exist are omitted.
    async fn get_statuses(&self, job_ids: &[String]) -> Result<Vec<JobStatusReport>, QueueError>;

    /// Id of a running job of `kind` for `episode_id`, other than `exclude_job_id`.
    async fn find_running(
        &self,
        kind: JobKind,
        episode_id: &str,
        exclude_job_id: Option<&str>,
    ) -> Result<Option<String>, QueueError>;

    /// Transition a job to running.
    async fn mark_running(&self, job_id: &str) -> Result<(), QueueError>;

    /// Replace a job's progress payload.
    async fn set_progress(&self, job_id: &str, progress: JobProgress) -> Result<(), QueueError>;

    /// Record a job's terminal outcome.
    async fn finish(&self, job_id: &str, outcome: JobOutcome) -> Result<(), QueueError>;
}

/// Writes progress updates to a job record.
pub struct JobProgressSink {
    jobs: Arc<dyn JobControl>,
    job_id: String,
}

impl JobProgressSink {
    pub fn new(jobs: Arc<dyn JobControl>, job_id: impl Into<String>) -> Self {
        Self {
            jobs,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn update(&self, progress: JobProgress) {
        tracing::debug!(job_id = %self.job_id, pct = progress.pct, "{}", progress.message);
        if let Err(e) = self.jobs.set_progress(&self.job_id, progress).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to write job progress");
        }
    }
}
