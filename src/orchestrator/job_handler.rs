//! Runs `run_episode_creation_agent` jobs through the orchestrator.

use std::sync::Arc;

use thiserror::Error;

use super::dispatch::{EpisodeJobPayload, QueueContinuation, QueueSceneDispatcher};
use super::episode::{
    EpisodeCreationOrchestrator, EpisodeRunRequest, OrchestratorFailure, RunHooks,
};
use super::summary::EpisodeRunResult;
use crate::scheduler::{JobControl, JobKind, JobOutcome, JobProgressSink, QueueError};

#[derive(Debug, Error)]
pub enum JobHandlerError {
    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Job {job_id} has kind {kind}, expected run_episode_creation_agent")]
    WrongKind { job_id: String, kind: JobKind },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Run(Box<OrchestratorFailure>),
}

/// Executes one queued episode creation job and records its outcome.
pub struct EpisodeCreationJobHandler {
    orchestrator: Arc<EpisodeCreationOrchestrator>,
    jobs: Arc<dyn JobControl>,
}

impl EpisodeCreationJobHandler {
    pub fn new(orchestrator: Arc<EpisodeCreationOrchestrator>, jobs: Arc<dyn JobControl>) -> Self {
        Self { orchestrator, jobs }
    }

    pub async fn handle(&self, job_id: &str) -> Result<EpisodeRunResult, JobHandlerError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobHandlerError::JobNotFound(job_id.to_string()))?;
        if job.kind != JobKind::RunEpisodeCreationAgent {
            return Err(JobHandlerError::WrongKind {
                job_id: job_id.to_string(),
                kind: job.kind,
            });
        }

        let payload: EpisodeJobPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                self.jobs
                    .finish(job_id, JobOutcome::Failed(format!("invalid payload: {}", e)))
                    .await?;
                return Err(e.into());
            }
        };

        self.jobs.mark_running(job_id).await?;
        tracing::info!(
            job_id,
            episode_id = %payload.episode_id,
            chunk = payload.chunk(),
            "Running episode creation job"
        );

        let episode = payload.episode();
        let mut hooks = RunHooks::new(Arc::new(JobProgressSink::new(self.jobs.clone(), job_id)))
            .with_continuation(Arc::new(
                QueueContinuation::new(self.jobs.clone(), payload.clone()).with_current_job(job_id),
            ));
        if payload.use_scene_child_jobs {
            hooks = hooks.with_scene_dispatcher(Arc::new(
                QueueSceneDispatcher::new(self.jobs.clone(), episode.clone())
                    .with_parent_job(job_id),
            ));
        }

        let mut request = EpisodeRunRequest::new(episode)
            .with_current_job(job_id)
            .with_chunk(payload.chunk());
        request.scene_chunk_size = payload.scene_chunk_size;
        request.scene_concurrency = payload.scene_concurrency;

        match self.orchestrator.run(request, hooks).await {
            Ok(result) => {
                self.jobs
                    .finish(job_id, JobOutcome::Succeeded(serde_json::to_value(&result)?))
                    .await?;
                Ok(result)
            }
            Err(failure) => {
                self.jobs
                    .finish(job_id, JobOutcome::Failed(failure.error.to_string()))
                    .await?;
                Err(JobHandlerError::Run(Box::new(failure)))
            }
        }
    }
}
