//! Bodies of the five pipeline stages.
//!
//! Each stage first checks persisted state and reports `skipped` when its
//! output already exists; that check is what makes a run resumable. The
//! scene stages process at most one chunk of pending scenes per invocation
//! and enqueue a continuation when work remains.

use std::sync::Arc;

use thiserror::Error;

use super::coordinator::{CoordinatorError, CoordinatorSettings, SceneChildCoordinator};
use super::dispatch::{ContinuationEnqueuer, SceneTaskDispatcher};
use super::executors::{ExecutorError, RefineOptions, StageExecutors, StageOutcome};
use super::summary::SceneChildTask;
use crate::concurrency::run_with_concurrency;
use crate::error::StoreError;
use crate::progress::{JobProgress, MappedProgress, ProgressSink};
use crate::scheduler::{JobControl, QueueError};
use crate::store::{
    has_scene_list, has_scene_script_draft, is_core_expression_present, pending_refinement,
    pending_sound_and_duration, EpisodeRef, EpisodeStore, SceneSnapshot,
};

/// Why a stage failed.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("scene list is empty, cannot {0}")]
    EmptySceneList(&'static str),
}

/// What a stage did.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StageReport {
    pub skipped: bool,
    pub message: String,
    pub outcome: StageOutcome,
}

impl StageReport {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            skipped: true,
            message: message.into(),
            outcome: StageOutcome::default(),
        }
    }

    fn done(message: impl Into<String>, outcome: StageOutcome) -> Self {
        Self {
            skipped: false,
            message: message.into(),
            outcome,
        }
    }
}

/// State carried across stages within one chunk.
#[derive(Debug, Default)]
pub(crate) struct ChunkState {
    pub continuation_job_id: Option<String>,
    pub scene_child_tasks: Vec<SceneChildTask>,
}

/// Everything a stage body needs. `progress` is already scoped to the stage.
pub(crate) struct StageContext<'a> {
    pub store: &'a dyn EpisodeStore,
    pub jobs: &'a dyn JobControl,
    pub executors: &'a dyn StageExecutors,
    pub episode: &'a EpisodeRef,
    pub chunk: u32,
    pub chunk_size: usize,
    pub coordinator: CoordinatorSettings,
    pub continuation: Option<&'a dyn ContinuationEnqueuer>,
    pub scene_dispatcher: Option<&'a dyn SceneTaskDispatcher>,
    pub progress: Arc<dyn ProgressSink>,
}

impl StageContext<'_> {
    /// Enqueue the next chunk if work remains and none is queued yet.
    async fn continue_if_needed(
        &self,
        state: &mut ChunkState,
        remaining: usize,
    ) -> Result<bool, StageError> {
        if remaining == 0 || state.continuation_job_id.is_some() {
            return Ok(false);
        }
        let Some(enqueuer) = self.continuation else {
            tracing::warn!(
                episode_id = %self.episode.episode_id,
                remaining,
                "Work remains but no continuation hook is configured"
            );
            return Ok(false);
        };
        let job_id = enqueuer.enqueue_continuation().await?;
        state.continuation_job_id = Some(job_id);
        Ok(true)
    }
}

pub(crate) async fn core_expression(ctx: &StageContext<'_>) -> Result<StageReport, StageError> {
    let episode = ctx.store.load_episode(ctx.episode).await?;
    if is_core_expression_present(&episode) {
        return Ok(StageReport::skipped("core expression already exists"));
    }
    let outcome = ctx
        .executors
        .generate_core_expression(ctx.episode, ctx.progress.clone())
        .await?;
    Ok(StageReport::done("core expression generated", outcome))
}

pub(crate) async fn scene_script(ctx: &StageContext<'_>) -> Result<StageReport, StageError> {
    let episode = ctx.store.load_episode(ctx.episode).await?;
    if has_scene_script_draft(&episode) {
        return Ok(StageReport::skipped("scene script already exists"));
    }
    let outcome = ctx
        .executors
        .generate_scene_script(ctx.episode, ctx.progress.clone())
        .await?;
    Ok(StageReport::done("scene script generated", outcome))
}

pub(crate) async fn scene_list(ctx: &StageContext<'_>) -> Result<StageReport, StageError> {
    let scenes = ctx.store.list_scenes(ctx.episode).await?;
    if has_scene_list(&scenes) {
        return Ok(StageReport::skipped(format!(
            "scene list already exists ({} scenes)",
            scenes.len()
        )));
    }
    let outcome = ctx
        .executors
        .generate_scene_list(ctx.episode, ctx.progress.clone())
        .await?;
    Ok(StageReport::done("scene list generated", outcome))
}

pub(crate) async fn scene_refinement(
    ctx: &StageContext<'_>,
    state: &mut ChunkState,
) -> Result<StageReport, StageError> {
    let scenes = ctx.store.list_scenes(ctx.episode).await?;
    if scenes.is_empty() {
        return Err(StageError::EmptySceneList("refine"));
    }
    let pending = pending_refinement(&scenes);
    if pending.is_empty() {
        return Ok(StageReport::skipped("all scenes already refined"));
    }

    let slice = &pending[..pending.len().min(ctx.chunk_size)];
    let outcome = match ctx.scene_dispatcher {
        Some(dispatcher) => {
            let coordinator = SceneChildCoordinator::new(ctx.jobs, dispatcher, ctx.coordinator);
            coordinator
                .run(
                    slice,
                    ctx.chunk,
                    &mut state.scene_child_tasks,
                    ctx.progress.clone(),
                )
                .await?;
            StageOutcome::default()
        }
        None => refine_in_process(ctx, slice).await?,
    };

    let remaining = pending_refinement(&ctx.store.list_scenes(ctx.episode).await?).len();
    let continued = ctx.continue_if_needed(state, remaining).await?;

    let message = if continued {
        format!(
            "refined {} scenes, {} remaining, continuation enqueued",
            slice.len(),
            remaining
        )
    } else if remaining > 0 {
        format!("refined {} scenes, {} remaining", slice.len(), remaining)
    } else {
        format!("refined {} scenes", slice.len())
    };
    Ok(StageReport::done(message, outcome))
}

/// Refine `slice` in lanes, each lane mapped into an equal share of the stage.
async fn refine_in_process(
    ctx: &StageContext<'_>,
    slice: &[SceneSnapshot],
) -> Result<StageOutcome, StageError> {
    let total = slice.len();
    let outcomes = run_with_concurrency(slice, ctx.coordinator.concurrency, |scene, index| {
        let stage_progress = ctx.progress.clone();
        async move {
            let (base, span) = lane_slice(index, total);
            stage_progress
                .update(JobProgress::new(
                    (base.round() as u8).min(99),
                    format!("refining scene #{} ({}/{})", scene.order, index + 1, total),
                ))
                .await;
            let sink = MappedProgress::new(stage_progress, base, span).into_sink();
            ctx.executors
                .refine_scene(ctx.episode, scene, RefineOptions::complete(), sink)
                .await
        }
    })
    .await?;
    Ok(StageOutcome::combine(&outcomes))
}

pub(crate) async fn sound_and_duration(
    ctx: &StageContext<'_>,
    state: &mut ChunkState,
) -> Result<StageReport, StageError> {
    if ctx.scene_dispatcher.is_some() {
        let message = if state.continuation_job_id.is_some() {
            "continuation enqueued; scene child tasks cover sound and duration"
        } else {
            "scene child tasks cover sound and duration"
        };
        return Ok(StageReport::skipped(message));
    }
    if state.continuation_job_id.is_some() {
        return Ok(StageReport::skipped(
            "continuation enqueued; sound and duration deferred to the next chunk",
        ));
    }

    let scenes = ctx.store.list_scenes(ctx.episode).await?;
    if scenes.is_empty() {
        return Err(StageError::EmptySceneList("generate sound and duration"));
    }
    let work = pending_sound_and_duration(&scenes);
    if work.is_empty() {
        return Ok(StageReport::skipped("sound and duration already present"));
    }

    let slice = &work[..work.len().min(ctx.chunk_size)];
    let total_units: usize = slice.iter().map(|w| w.units()).sum();
    let mut unit_index = 0;
    let mut outcomes = Vec::with_capacity(total_units);

    for item in slice {
        if item.need_sound {
            let sink = unit_sink(ctx, unit_index, total_units, "sound design", &item.scene).await;
            outcomes.push(
                ctx.executors
                    .generate_sound_design(ctx.episode, &item.scene, sink)
                    .await?,
            );
            unit_index += 1;
        }
        if item.need_duration {
            let sink =
                unit_sink(ctx, unit_index, total_units, "duration estimate", &item.scene).await;
            outcomes.push(
                ctx.executors
                    .estimate_duration(ctx.episode, &item.scene, sink)
                    .await?,
            );
            unit_index += 1;
        }
    }

    let remaining = work.len() - slice.len();
    let continued = ctx.continue_if_needed(state, remaining).await?;
    let message = if continued {
        format!(
            "sound and duration for {} scenes, {} remaining, continuation enqueued",
            slice.len(),
            remaining
        )
    } else {
        format!("sound and duration for {} scenes", slice.len())
    };
    Ok(StageReport::done(message, StageOutcome::combine(&outcomes)))
}

/// Announce one unit of sound/duration work and return its mapped sink.
async fn unit_sink(
    ctx: &StageContext<'_>,
    unit_index: usize,
    total_units: usize,
    label: &str,
    scene: &SceneSnapshot,
) -> Arc<dyn ProgressSink> {
    let (base, span) = lane_slice(unit_index, total_units);
    ctx.progress
        .update(JobProgress::new(
            (base.round() as u8).min(99),
            format!(
                "{} #{} ({}/{})",
                label,
                scene.order,
                unit_index + 1,
                total_units
            ),
        ))
        .await;
    MappedProgress::new(ctx.progress.clone(), base, span).into_sink()
}

/// `(base, span)` of item `index` out of `total` equal shares of 0-100.
fn lane_slice(index: usize, total: usize) -> (f64, f64) {
    let total = total.max(1) as f64;
    (index as f64 / total * 100.0, 100.0 / total)
}
