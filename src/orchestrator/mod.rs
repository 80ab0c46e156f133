//! Episode creation orchestration.
//!
//! A run walks five stages in order for one chunk of an episode:
//!
//! ```text
//!   planning (optional agent loop, falls back to legacy)
//!      |
//!   core_expression -> scene_script -> scene_list
//!      |
//!   scene_refinement --(child jobs)--> SceneChildCoordinator
//!      |
//!   sound_and_duration
//!      |
//!   continuation enqueued if scenes remain
//! ```
//!
//! Every stage checks persisted state first, so a re-run skips what is
//! already done. Progress is mapped so each stage owns a fixed slice of
//! the run's 0-100 scale.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod episode;
pub mod executors;
pub mod job_handler;
pub mod planning;
mod stages;
pub mod summary;

pub use config::{ConfigError, OrchestratorConfig};
pub use coordinator::{CoordinatorError, CoordinatorSettings, SceneChildCoordinator};
pub use dispatch::{
    ContinuationEnqueuer, EpisodeJobPayload, QueueContinuation, QueueSceneDispatcher,
    SceneJobPayload, SceneTaskDispatcher,
};
pub use episode::{
    EpisodeCreationOrchestrator, EpisodeRunRequest, OrchestratorError, OrchestratorFailure,
    RunHooks,
};
pub use executors::{ExecutorError, RefineOptions, StageExecutors, StageOutcome};
pub use job_handler::{EpisodeCreationJobHandler, JobHandlerError};
pub use planning::{episode_context, PLANNING_FALLBACK_REASON};
pub use stages::StageError;
pub use summary::{
    summarize_error, ChildTaskStatus, EpisodeRunResult, SceneChildStats, SceneChildTask, Stage,
    StepStatus, StepSummary,
};
