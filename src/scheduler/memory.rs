//! In-process job store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::control::{JobControl, JobStatusReport, QueueError};
use super::job::{Job, JobKind, JobOutcome, JobStatus};
use crate::progress::JobProgress;

/// Job store backed by a map. Used by tests and single-process runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job record as-is.
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    /// All jobs of a kind, oldest first.
    pub async fn jobs_of_kind(&self, kind: JobKind) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.kind == kind)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn update<F>(&self, job_id: &str, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobControl for MemoryJobStore {
    async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<String, QueueError> {
        let job = Job::new(kind, payload);
        let id = job.id.clone();
        self.insert(job).await;
        Ok(id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn get_statuses(&self, job_ids: &[String]) -> Result<Vec<JobStatusReport>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(job_ids
            .iter()
            .filter_map(|id| jobs.get(id))
            .map(JobStatusReport::from_job)
            .collect())
    }

    async fn find_running(
        &self,
        kind: JobKind,
        episode_id: &str,
        exclude_job_id: Option<&str>,
    ) -> Result<Option<String>, QueueError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|job| {
                job.kind == kind
                    && job.status == JobStatus::Running
                    && job.episode_id.as_deref() == Some(episode_id)
                    && Some(job.id.as_str()) != exclude_job_id
            })
            .map(|job| job.id.clone()))
    }

    async fn mark_running(&self, job_id: &str) -> Result<(), QueueError> {
        self.update(job_id, Job::start).await
    }

    async fn set_progress(&self, job_id: &str, progress: JobProgress) -> Result<(), QueueError> {
        self.update(job_id, |job| {
            job.progress = Some(progress);
            job.updated_at = chrono::Utc::now();
        })
        .await
    }

    async fn finish(&self, job_id: &str, outcome: JobOutcome) -> Result<(), QueueError> {
        self.update(job_id, |job| job.finish(outcome)).await
    }
}
