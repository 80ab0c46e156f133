//! Episode creation orchestrator.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use super::config::OrchestratorConfig;
use super::coordinator::CoordinatorSettings;
use super::dispatch::{ContinuationEnqueuer, SceneTaskDispatcher};
use super::executors::StageExecutors;
use super::planning::run_planning;
use super::stages::{self, ChunkState, StageContext, StageError, StageReport};
use super::summary::{
    summarize_error, EpisodeRunResult, SceneChildTask, Stage, StepStatus, StepSummary,
};
use crate::agent::{AgentError, AgentTrace, ExecutionMode, ModelCaller};
use crate::error::StoreError;
use crate::progress::{HighWaterProgress, JobProgress, MappedProgress, ProgressSink};
use crate::scheduler::{JobControl, JobKind, QueueError};
use crate::store::{EpisodeRef, EpisodeStore};

const START_PCT: u8 = 2;
const PLANNING_PCT: u8 = 5;
const DONE_PCT: u8 = 100;

/// Errors that end an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another run for the same episode is in progress.
    #[error("Episode creation agent is already running for this episode ({0})")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The planning loop failed and fallback is disabled.
    #[error("episode creation planning failed: {0}")]
    Planning(#[source] AgentError),

    #[error("episode creation step failed [{stage}]: {message}")]
    Stage {
        stage: Stage,
        message: String,
        #[source]
        source: StageError,
    },
}

/// A failed run, with whatever was accumulated before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OrchestratorFailure {
    pub error: OrchestratorError,
    pub step_summaries: Vec<StepSummary>,
    pub scene_child_tasks: Vec<SceneChildTask>,
    pub agent_trace: Option<AgentTrace>,
}

/// One chunk of work for one episode.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeRunRequest {
    pub episode: EpisodeRef,
    /// The job this run executes as; excluded from the single-flight check.
    pub current_job_id: Option<String>,
    /// 1-based chunk index.
    pub chunk: u32,
    pub scene_chunk_size: Option<usize>,
    pub scene_concurrency: Option<usize>,
}

impl EpisodeRunRequest {
    pub fn new(episode: EpisodeRef) -> Self {
        Self {
            episode,
            current_job_id: None,
            chunk: 1,
            scene_chunk_size: None,
            scene_concurrency: None,
        }
    }

    pub fn with_current_job(mut self, job_id: impl Into<String>) -> Self {
        self.current_job_id = Some(job_id.into());
        self
    }

    pub fn with_chunk(mut self, chunk: u32) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn with_scene_chunk_size(mut self, size: usize) -> Self {
        self.scene_chunk_size = Some(size);
        self
    }

    pub fn with_scene_concurrency(mut self, concurrency: usize) -> Self {
        self.scene_concurrency = Some(concurrency);
        self
    }
}

/// Caller-supplied hooks for one run.
#[derive(Clone)]
pub struct RunHooks {
    pub progress: Arc<dyn ProgressSink>,
    pub continuation: Option<Arc<dyn ContinuationEnqueuer>>,
    pub scene_dispatcher: Option<Arc<dyn SceneTaskDispatcher>>,
}

impl RunHooks {
    pub fn new(progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            progress,
            continuation: None,
            scene_dispatcher: None,
        }
    }

    pub fn with_continuation(mut self, continuation: Arc<dyn ContinuationEnqueuer>) -> Self {
        self.continuation = Some(continuation);
        self
    }

    pub fn with_scene_dispatcher(mut self, dispatcher: Arc<dyn SceneTaskDispatcher>) -> Self {
        self.scene_dispatcher = Some(dispatcher);
        self
    }
}

/// Accumulators for one run.
struct RunState {
    chunk: ChunkState,
    step_summaries: Vec<StepSummary>,
    agent_trace: Option<AgentTrace>,
    execution_mode: ExecutionMode,
    fallback_used: bool,
}

impl RunState {
    fn new() -> Self {
        Self {
            chunk: ChunkState::default(),
            step_summaries: Vec::new(),
            agent_trace: None,
            execution_mode: ExecutionMode::Legacy,
            fallback_used: false,
        }
    }
}

/// Runs the five stages for one chunk of an episode.
pub struct EpisodeCreationOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn EpisodeStore>,
    jobs: Arc<dyn JobControl>,
    executors: Arc<dyn StageExecutors>,
    planner: Option<Arc<dyn ModelCaller>>,
}

impl EpisodeCreationOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn EpisodeStore>,
        jobs: Arc<dyn JobControl>,
        executors: Arc<dyn StageExecutors>,
    ) -> Self {
        Self {
            config,
            store,
            jobs,
            executors,
            planner: None,
        }
    }

    /// Model used by the planning pass. Without one, planning is skipped.
    pub fn with_planner(mut self, planner: Arc<dyn ModelCaller>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one chunk.
    ///
    /// Stages run in order and skip work whose output already exists, so
    /// re-running after a failure resumes where the failed run stopped.
    pub async fn run(
        &self,
        request: EpisodeRunRequest,
        hooks: RunHooks,
    ) -> Result<EpisodeRunResult, OrchestratorFailure> {
        let mut state = RunState::new();
        let observed = Arc::new(HighWaterProgress::new(hooks.progress.clone()));
        let hooks = RunHooks {
            progress: observed.clone(),
            ..hooks
        };

        match self.run_chunk(&request, &hooks, &mut state).await {
            Ok(()) => {
                let continued = state.chunk.continuation_job_id.is_some();
                let message = if continued {
                    "Episode creation agent chunk finished, continuation enqueued"
                } else {
                    "Episode creation agent finished"
                };
                hooks
                    .progress
                    .update(
                        JobProgress::new(DONE_PCT, message)
                            .with_extra("stepSummaries", json!(state.step_summaries)),
                    )
                    .await;

                tracing::info!(
                    episode_id = %request.episode.episode_id,
                    chunk = request.chunk,
                    continued,
                    "Episode creation chunk completed"
                );

                let agent_steps = state
                    .agent_trace
                    .as_ref()
                    .map(AgentTrace::step_summaries)
                    .unwrap_or_default();
                Ok(EpisodeRunResult {
                    project_id: request.episode.project_id.clone(),
                    episode_id: request.episode.episode_id.clone(),
                    chunk: request.chunk,
                    execution_mode: state.execution_mode,
                    fallback_used: state.fallback_used,
                    agent_trace: state.agent_trace,
                    step_summaries: state.step_summaries,
                    scene_child_tasks: state.chunk.scene_child_tasks,
                    agent_steps,
                    continued,
                    next_job_id: state.chunk.continuation_job_id,
                })
            }
            Err(error) => {
                tracing::error!(
                    episode_id = %request.episode.episode_id,
                    chunk = request.chunk,
                    error = %error,
                    "Episode creation chunk failed"
                );
                hooks
                    .progress
                    .update(
                        JobProgress::new(
                            observed.current(),
                            format!(
                                "Episode creation agent failed: {}",
                                summarize_error(&error.to_string())
                            ),
                        )
                        .with_extra("stepSummaries", json!(state.step_summaries))
                        .with_extra("sceneChildTasks", json!(state.chunk.scene_child_tasks)),
                    )
                    .await;
                Err(OrchestratorFailure {
                    error,
                    step_summaries: state.step_summaries,
                    scene_child_tasks: state.chunk.scene_child_tasks,
                    agent_trace: state.agent_trace,
                })
            }
        }
    }

    async fn run_chunk(
        &self,
        request: &EpisodeRunRequest,
        hooks: &RunHooks,
        state: &mut RunState,
    ) -> Result<(), OrchestratorError> {
        let episode = &request.episode;
        self.report(
            hooks,
            START_PCT,
            format!("Episode creation agent started (chunk {})", request.chunk),
        )
        .await;

        if let Some(running) = self
            .jobs
            .find_running(
                JobKind::RunEpisodeCreationAgent,
                &episode.episode_id,
                request.current_job_id.as_deref(),
            )
            .await?
        {
            return Err(OrchestratorError::Conflict(running));
        }

        self.store.load_episode(episode).await?;

        match (&self.planner, self.config.agent_enabled) {
            (Some(planner), true) => {
                self.report(
                    hooks,
                    PLANNING_PCT,
                    "Episode creation agent planning",
                )
                .await;
                let planned = run_planning(
                    planner.clone(),
                    self.config.agent.clone(),
                    self.store.clone(),
                    episode,
                    hooks.progress.clone(),
                )
                .await;
                match planned {
                    Ok(outcome) => {
                        state.execution_mode = outcome.execution_mode;
                        state.fallback_used = outcome.fallback_used;
                        state.agent_trace = Some(outcome.trace);
                    }
                    Err(failure) => {
                        state.agent_trace = Some(failure.trace);
                        return Err(OrchestratorError::Planning(failure.error));
                    }
                }
            }
            (None, true) => {
                tracing::debug!("No planner configured, running stages in legacy mode");
            }
            _ => {}
        }

        for stage in Stage::ALL {
            self.run_stage(stage, request, hooks, state).await?;
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &EpisodeRunRequest,
        hooks: &RunHooks,
        state: &mut RunState,
    ) -> Result<(), OrchestratorError> {
        let (base, span) = stage.progress_slice();
        self.report(
            hooks,
            base,
            format!("Episode creation agent: {}", stage.title()),
        )
        .await;

        let chunk_size = request
            .scene_chunk_size
            .filter(|size| *size > 0)
            .unwrap_or(self.config.scene_chunk_size)
            .max(1);
        let concurrency = request
            .scene_concurrency
            .filter(|c| *c > 0)
            .unwrap_or(self.config.scene_concurrency)
            .max(1);

        let ctx = StageContext {
            store: self.store.as_ref(),
            jobs: self.jobs.as_ref(),
            executors: self.executors.as_ref(),
            episode: &request.episode,
            chunk: request.chunk,
            chunk_size,
            coordinator: CoordinatorSettings {
                concurrency,
                wait_timeout: self.config.child_wait_timeout,
                poll_interval: self.config.child_poll_interval,
                unknown_poll_limit: self.config.child_unknown_poll_limit,
            },
            continuation: hooks.continuation.as_deref(),
            scene_dispatcher: hooks.scene_dispatcher.as_deref(),
            progress: MappedProgress::new(hooks.progress.clone(), f64::from(base), f64::from(span))
                .with_title(stage.title())
                .into_sink(),
        };

        let result = match stage {
            Stage::CoreExpression => stages::core_expression(&ctx).await,
            Stage::SceneScript => stages::scene_script(&ctx).await,
            Stage::SceneList => stages::scene_list(&ctx).await,
            Stage::SceneRefinement => stages::scene_refinement(&ctx, &mut state.chunk).await,
            Stage::SoundAndDuration => stages::sound_and_duration(&ctx, &mut state.chunk).await,
        };

        match result {
            Ok(report) => {
                tracing::info!(
                    stage = %stage,
                    skipped = report.skipped,
                    chunk = request.chunk,
                    "{}",
                    report.message
                );
                state
                    .step_summaries
                    .push(summary_for(stage, request, report));
                Ok(())
            }
            Err(source) => {
                let message = summarize_error(&source.to_string());
                state.step_summaries.push(StepSummary {
                    step: stage,
                    status: StepStatus::Failed,
                    message: message.clone(),
                    execution_mode: None,
                    fallback_used: None,
                    chunk: request.chunk,
                    source_job_id: request.current_job_id.clone(),
                });
                Err(OrchestratorError::Stage {
                    stage,
                    message,
                    source,
                })
            }
        }
    }

    async fn report(&self, hooks: &RunHooks, pct: u8, message: impl Into<String>) {
        hooks.progress.update(JobProgress::new(pct, message)).await;
    }
}

fn summary_for(stage: Stage, request: &EpisodeRunRequest, report: StageReport) -> StepSummary {
    StepSummary {
        step: stage,
        status: if report.skipped {
            StepStatus::Skipped
        } else {
            StepStatus::Succeeded
        },
        message: report.message,
        execution_mode: report.outcome.execution_mode,
        fallback_used: report
            .outcome
            .execution_mode
            .map(|_| report.outcome.fallback_used),
        chunk: request.chunk,
        source_job_id: request.current_job_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = EpisodeRunRequest::new(EpisodeRef::new("t", "p", "e"))
            .with_chunk(0)
            .with_current_job("job-1")
            .with_scene_chunk_size(3);
        assert_eq!(request.chunk, 1);
        assert_eq!(request.current_job_id.as_deref(), Some("job-1"));
        assert_eq!(request.scene_chunk_size, Some(3));
        assert_eq!(request.scene_concurrency, None);
    }

    #[test]
    fn test_conflict_message() {
        let err = OrchestratorError::Conflict("job-9".into());
        assert_eq!(
            err.to_string(),
            "Episode creation agent is already running for this episode (job-9)"
        );
    }

    #[test]
    fn test_stage_error_message() {
        let err = OrchestratorError::Stage {
            stage: Stage::SceneRefinement,
            message: "scene list is empty, cannot refine".into(),
            source: StageError::EmptySceneList("refine"),
        };
        assert_eq!(
            err.to_string(),
            "episode creation step failed [scene_refinement]: scene list is empty, cannot refine"
        );
    }
}
