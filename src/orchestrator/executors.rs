//! Stage executor seam.
//!
//! The AI-call bodies of each stage live outside this crate. Each executor
//! writes its output to persisted state and reports its own 0-100 progress;
//! the orchestrator maps that into the stage's slice.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::{AgentError, ExecutionMode};
use crate::error::{LlmError, StoreError};
use crate::progress::ProgressSink;
use crate::store::{EpisodeRef, SceneSnapshot};

/// Errors raised by stage executors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// What an executor reports about how it produced its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Set when the executor ran its own agent loop.
    pub execution_mode: Option<ExecutionMode>,
    pub fallback_used: bool,
}

impl StageOutcome {
    pub fn agent() -> Self {
        Self {
            execution_mode: Some(ExecutionMode::Agent),
            fallback_used: false,
        }
    }

    pub fn legacy_fallback() -> Self {
        Self {
            execution_mode: Some(ExecutionMode::Legacy),
            fallback_used: true,
        }
    }

    /// Combine per-scene outcomes: any fallback makes the whole legacy.
    pub fn combine(outcomes: &[StageOutcome]) -> Self {
        let fallback_used = outcomes.iter().any(|o| o.fallback_used);
        let execution_mode = if outcomes.iter().any(|o| o.execution_mode.is_some()) {
            Some(if fallback_used {
                ExecutionMode::Legacy
            } else {
                ExecutionMode::Agent
            })
        } else {
            None
        };
        Self {
            execution_mode,
            fallback_used,
        }
    }
}

/// Options for refining a single scene in-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefineOptions {
    pub include_sound_design: bool,
    pub include_duration_estimate: bool,
}

impl RefineOptions {
    /// Refine the scene and also produce its sound design and duration estimate.
    pub fn complete() -> Self {
        Self {
            include_sound_design: true,
            include_duration_estimate: true,
        }
    }
}

/// The five stage bodies, plus the per-scene work of the last two stages.
#[async_trait]
pub trait StageExecutors: Send + Sync {
    async fn generate_core_expression(
        &self,
        episode: &EpisodeRef,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;

    async fn generate_scene_script(
        &self,
        episode: &EpisodeRef,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;

    async fn generate_scene_list(
        &self,
        episode: &EpisodeRef,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;

    /// Refine one scene; on success the scene's status becomes `completed`.
    async fn refine_scene(
        &self,
        episode: &EpisodeRef,
        scene: &SceneSnapshot,
        options: RefineOptions,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;

    async fn generate_sound_design(
        &self,
        episode: &EpisodeRef,
        scene: &SceneSnapshot,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;

    async fn estimate_duration(
        &self,
        episode: &EpisodeRef,
        scene: &SceneSnapshot,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StageOutcome, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_outcomes() {
        assert_eq!(StageOutcome::combine(&[]), StageOutcome::default());
        assert_eq!(
            StageOutcome::combine(&[StageOutcome::agent(), StageOutcome::agent()]),
            StageOutcome::agent()
        );
        assert_eq!(
            StageOutcome::combine(&[StageOutcome::agent(), StageOutcome::legacy_fallback()]),
            StageOutcome::legacy_fallback()
        );
        assert_eq!(
            StageOutcome::combine(&[StageOutcome::default(), StageOutcome::default()]),
            StageOutcome::default()
        );
    }
}
