//! Redis-backed job store.
//!
//! # Key layout
//!
//! - `{prefix}:job:{id}`: JSON job record
//! - `{prefix}:pending:{kind}`: list of queued job ids, consumed by the
//!   queue transport's workers (LPUSH here, RPOP there)
//! - `{prefix}:episode:{episode_id}`: set of job ids for an episode
//!
//! Record updates are read-modify-write. The transport guarantees a single
//! worker per job id, so each record has one writer at a time.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use super::control::{JobControl, JobStatusReport, QueueError};
use super::job::{Job, JobKind, JobOutcome, JobStatus};
use crate::progress::JobProgress;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "episode-forge";

/// Job store backed by Redis.
#[derive(Clone)]
pub struct RedisJobStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisJobStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn job_key(&self, job_id: &str) -> String {
        job_key(&self.prefix, job_id)
    }

    fn pending_key(&self, kind: JobKind) -> String {
        format!("{}:pending:{}", self.prefix, kind.as_str())
    }

    fn episode_key(&self, episode_id: &str) -> String {
        format!("{}:episode:{}", self.prefix, episode_id)
    }

    /// Number of queued job ids waiting for a worker.
    pub async fn pending_len(&self, kind: JobKind) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.pending_key(kind)).await?;
        Ok(len)
    }

    async fn load_many(&self, job_ids: &[String]) -> Result<Vec<Option<String>>, QueueError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = job_ids.iter().map(|id| self.job_key(id)).collect();
        let mut conn = self.redis.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.job_key(&job.id), serialized)
            .await?;
        Ok(())
    }

    async fn update<F>(&self, job_id: &str, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        f(&mut job);
        self.save(&job).await
    }
}

fn job_key(prefix: &str, job_id: &str) -> String {
    format!("{}:job:{}", prefix, job_id)
}

/// Read a status report from a raw record without requiring the whole
/// record to deserialize, so unrecognised statuses surface as `None`.
fn status_report(job_id: &str, raw: &str) -> Result<JobStatusReport, QueueError> {
    let value: Value = serde_json::from_str(raw)?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .and_then(JobStatus::parse);
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.trim().is_empty())
        .map(str::to_string);
    Ok(JobStatusReport {
        job_id: job_id.to_string(),
        status,
        error,
    })
}

/// First record of `kind` that is running. Records that fail to parse are skipped.
fn first_running<'a, I>(kind: JobKind, records: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    records.into_iter().find_map(|(job_id, data)| {
        match serde_json::from_str::<Job>(&data) {
            Ok(job) if job.kind == kind && job.status == JobStatus::Running => Some(job.id),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Skipping unreadable job record");
                None
            }
        }
    })
}

#[async_trait]
impl JobControl for RedisJobStore {
    async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<String, QueueError> {
        let job = Job::new(kind, payload);
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(&job.id), &serialized)
            .lpush(self.pending_key(kind), &job.id);
        if let Some(episode_id) = &job.episode_id {
            pipe.sadd(self.episode_key(episode_id), &job.id);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        tracing::debug!(job_id = %job.id, kind = %kind, "Enqueued job");
        Ok(job.id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn get_statuses(&self, job_ids: &[String]) -> Result<Vec<JobStatusReport>, QueueError> {
        let raw = self.load_many(job_ids).await?;
        job_ids
            .iter()
            .zip(raw)
            .filter_map(|(id, data)| data.map(|d| status_report(id, &d)))
            .collect()
    }

    async fn find_running(
        &self,
        kind: JobKind,
        episode_id: &str,
        exclude_job_id: Option<&str>,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(self.episode_key(episode_id)).await?;
        let candidates: Vec<String> = ids
            .into_iter()
            .filter(|id| Some(id.as_str()) != exclude_job_id)
            .collect();

        let raw = self.load_many(&candidates).await?;
        Ok(first_running(
            kind,
            candidates
                .iter()
                .zip(raw)
                .filter_map(|(id, data)| data.map(|d| (id.as_str(), d))),
        ))
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
