//! Scene child-task coordinator.
//!
//! Dispatches one child job per scene with bounded concurrency, then polls
//! their statuses until every child has succeeded. The first failed or
//! cancelled child aborts the wait; so does the deadline, and so does a
//! child whose status stays unknown for too many consecutive polls.
//!
//! Progress within the stage slice: dispatch covers 0-35, polling 35-99.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use super::dispatch::SceneTaskDispatcher;
use super::summary::{ChildTaskStatus, SceneChildStats, SceneChildTask};
use crate::concurrency::run_with_concurrency;
use crate::progress::{JobProgress, ProgressSink};
use crate::scheduler::{JobControl, QueueError};
use crate::store::SceneSnapshot;

const DISPATCH_PROGRESS_SPAN: f64 = 30.0;
const DISPATCH_PROGRESS_CEILING: u8 = 35;
const POLL_PROGRESS_BASE: f64 = 35.0;
const POLL_PROGRESS_SPAN: f64 = 65.0;

/// Errors raised while coordinating child tasks.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("scene child task dispatch failed (#{order}): {source}")]
    Dispatch {
        order: u32,
        #[source]
        source: QueueError,
    },

    #[error("scene child task failed (#{order}, job={job_id}): {reason}")]
    ChildFailed {
        order: u32,
        job_id: String,
        reason: String,
    },

    #[error("scene child task status unknown (#{order}, job={job_id}) after {polls} polls")]
    ChildUnknown {
        order: u32,
        job_id: String,
        polls: u32,
    },

    #[error("scene child tasks timeout ({succeeded}/{total})")]
    Timeout { succeeded: usize, total: usize },

    #[error("scene child task status lookup failed: {0}")]
    Poll(#[from] QueueError),
}

/// Timing and fan-out limits for one coordinated wait.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub concurrency: usize,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub unknown_poll_limit: u32,
}

/// Dispatches and waits on per-scene child jobs.
pub struct SceneChildCoordinator<'a> {
    jobs: &'a dyn JobControl,
    dispatcher: &'a dyn SceneTaskDispatcher,
    settings: CoordinatorSettings,
}

impl<'a> SceneChildCoordinator<'a> {
    pub fn new(
        jobs: &'a dyn JobControl,
        dispatcher: &'a dyn SceneTaskDispatcher,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            jobs,
            dispatcher,
            settings,
        }
    }

    /// Dispatch `scenes` and wait for all of them to succeed.
    ///
    /// Dispatched tasks are appended to `tasks` and kept up to date as polls
    /// come in, so the caller sees their last observed state on failure.
    pub async fn run(
        &self,
        scenes: &[SceneSnapshot],
        chunk: u32,
        tasks: &mut Vec<SceneChildTask>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), CoordinatorError> {
        if scenes.is_empty() {
            return Ok(());
        }

        let start = tasks.len();
        self.dispatch_all(scenes, chunk, tasks, &progress).await?;
        self.wait_all(start, tasks, &progress).await
    }

    async fn dispatch_all(
        &self,
        scenes: &[SceneSnapshot],
        chunk: u32,
        tasks: &mut Vec<SceneChildTask>,
        progress: &Arc<dyn ProgressSink>,
    ) -> Result<(), CoordinatorError> {
        let total = scenes.len();
        let dispatcher = self.dispatcher;
        let earlier: &[SceneChildTask] = tasks;
        let slots: Mutex<Vec<Option<SceneChildTask>>> = Mutex::new(vec![None; total]);
        let slots_ref = &slots;

        let dispatched = run_with_concurrency(scenes, self.settings.concurrency, |scene, index| {
            let progress = progress.clone();
            async move {
                let result = dispatcher.dispatch(scene).await;
                let snapshot = {
                    let mut slots = slots_ref.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Ok(job_id) = &result {
                        slots[index] = Some(SceneChildTask {
                            scene_id: scene.id.clone(),
                            order: scene.order,
                            job_id: job_id.clone(),
                            status: ChildTaskStatus::Queued,
                            error: None,
                            chunk,
                        });
                    }
                    earlier
                        .iter()
                        .cloned()
                        .chain(slots.iter().flatten().cloned())
                        .collect::<Vec<_>>()
                };
                progress
                    .update(child_progress(
                        dispatch_pct(index + 1, total),
                        format!("dispatched scene #{} ({}/{})", scene.order, index + 1, total),
                        &snapshot,
                    ))
                    .await;
                Ok::<_, Infallible>((scene, result))
            }
        })
        .await
        .unwrap_or_else(|never| match never {});

        let dispatched_tasks: Vec<SceneChildTask> = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        tasks.extend(dispatched_tasks);

        let mut first_error = None;
        for (scene, result) in dispatched {
            let Err(source) = result else {
                continue;
            };
            if first_error.is_none() {
                first_error = Some(CoordinatorError::Dispatch {
                    order: scene.order,
                    source,
                });
            } else {
                tracing::warn!(order = scene.order, error = %source, "Scene child dispatch failed");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn wait_all(
        &self,
        start: usize,
        tasks: &mut [SceneChildTask],
        progress: &Arc<dyn ProgressSink>,
    ) -> Result<(), CoordinatorError> {
        let deadline = Instant::now() + self.settings.wait_timeout;
        let mut unknown_polls = vec![0u32; tasks.len() - start];

        loop {
            let ids: Vec<String> = tasks[start..].iter().map(|t| t.job_id.clone()).collect();
            let reports: HashMap<String, _> = self
                .jobs
                .get_statuses(&ids)
                .await?
                .into_iter()
                .map(|report| (report.job_id.clone(), report))
                .collect();

            for (task, unknown) in tasks[start..].iter_mut().zip(unknown_polls.iter_mut()) {
                let status = match reports.get(&task.job_id) {
                    Some(report) => {
                        if report.error.is_some() {
                            task.error = report.error.clone();
                        }
                        report
                            .status
                            .map(ChildTaskStatus::from)
                            .unwrap_or(ChildTaskStatus::Unknown)
                    }
                    None => ChildTaskStatus::Unknown,
                };
                task.status = status;
                if status == ChildTaskStatus::Unknown {
                    *unknown += 1;
                } else {
                    *unknown = 0;
                }
            }

            let chunk_tasks = &tasks[start..];
            if let Some(task) = chunk_tasks.iter().find(|t| {
                matches!(
                    t.status,
                    ChildTaskStatus::Failed | ChildTaskStatus::Cancelled
                )
            }) {
                return Err(CoordinatorError::ChildFailed {
                    order: task.order,
                    job_id: task.job_id.clone(),
                    reason: task
                        .error
                        .clone()
                        .unwrap_or_else(|| task.status.to_string()),
                });
            }

            if let Some((task, polls)) = chunk_tasks
                .iter()
                .zip(unknown_polls.iter())
                .find(|(task, polls)| {
                    task.status == ChildTaskStatus::Unknown
                        && **polls >= self.settings.unknown_poll_limit.max(1)
                })
            {
                return Err(CoordinatorError::ChildUnknown {
                    order: task.order,
                    job_id: task.job_id.clone(),
                    polls: *polls,
                });
            }

            let total = chunk_tasks.len();
            let succeeded = chunk_tasks
                .iter()
                .filter(|t| t.status == ChildTaskStatus::Succeeded)
                .count();
            progress
                .update(child_progress(
                    poll_pct(succeeded, total),
                    format!("scene child tasks {}/{} succeeded", succeeded, total),
                    tasks,
                ))
                .await;

            if succeeded == total {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoordinatorError::Timeout { succeeded, total });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// A progress update carrying copies of the child tasks and their counts.
fn child_progress(pct: u8, message: String, tasks: &[SceneChildTask]) -> JobProgress {
    JobProgress::new(pct, message)
        .with_extra("sceneChildTasks", json!(tasks))
        .with_extra("sceneChildStats", json!(SceneChildStats::from_tasks(tasks)))
}

fn dispatch_pct(dispatched: usize, total: usize) -> u8 {
    let pct = (dispatched as f64 / total as f64 * DISPATCH_PROGRESS_SPAN).round() as u8;
    pct.min(DISPATCH_PROGRESS_CEILING)
}

fn poll_pct(succeeded: usize, total: usize) -> u8 {
    let pct = (POLL_PROGRESS_BASE + succeeded as f64 / total as f64 * POLL_PROGRESS_SPAN).round();
    pct.min(99.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgressSink;
    use crate::scheduler::{JobKind, JobOutcome, JobStatus, MemoryJobStore};
    use crate::store::SceneStatus;
    use async_trait::async_trait;

    struct StoreDispatcher {
        jobs: Arc<MemoryJobStore>,
        dispatched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SceneTaskDispatcher for StoreDispatcher {
        async fn dispatch(&self, scene: &SceneSnapshot) -> Result<String, QueueError> {
            let id = self
                .jobs
                .enqueue(JobKind::RefineSceneAll, serde_json::json!({"sceneId": scene.id}))
                .await?;
            self.dispatched.lock().unwrap().push(id.clone());
            Ok(id)
        }
    }

    /// Enqueues the child and finishes it before returning its id.
    struct InstantDispatcher {
        jobs: Arc<MemoryJobStore>,
    }

    #[async_trait]
    impl SceneTaskDispatcher for InstantDispatcher {
        async fn dispatch(&self, scene: &SceneSnapshot) -> Result<String, QueueError> {
            let id = self
                .jobs
                .enqueue(JobKind::RefineSceneAll, serde_json::json!({"sceneId": scene.id}))
                .await?;
            self.jobs
                .finish(&id, JobOutcome::Succeeded(serde_json::json!({})))
                .await?;
            Ok(id)
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<JobProgress>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn update(&self, progress: JobProgress) {
            self.updates.lock().unwrap().push(progress);
        }
    }

    struct GhostDispatcher;

    #[async_trait]
    impl SceneTaskDispatcher for GhostDispatcher {
        async fn dispatch(&self, scene: &SceneSnapshot) -> Result<String, QueueError> {
            Ok(format!("ghost-{}", scene.id))
        }
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            concurrency: 2,
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            unknown_poll_limit: 3,
        }
    }

    fn scenes(n: u32) -> Vec<SceneSnapshot> {
        (1..=n)
            .map(|i| SceneSnapshot::new(format!("s{}", i), i, SceneStatus::Pending))
            .collect()
    }

    #[test]
    fn test_progress_arithmetic() {
        assert_eq!(dispatch_pct(1, 2), 15);
        assert_eq!(dispatch_pct(2, 2), 30);
        assert_eq!(poll_pct(0, 4), 35);
        assert_eq!(poll_pct(2, 4), 68);
        assert_eq!(poll_pct(4, 4), 99);
    }

    #[tokio::test]
    async fn test_all_children_succeed() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = StoreDispatcher {
            jobs: jobs.clone(),
            dispatched: Mutex::new(Vec::new()),
        };

        let finisher = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                loop {
                    let pending = jobs.jobs_of_kind(JobKind::RefineSceneAll).await;
                    if pending.len() == 3 {
                        for job in pending {
                            jobs.finish(&job.id, JobOutcome::Succeeded(serde_json::json!({})))
                                .await
                                .unwrap();
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings());
        let mut tasks = Vec::new();
        coordinator
            .run(&scenes(3), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .expect("all children succeed");
        finisher.await.unwrap();

        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == ChildTaskStatus::Succeeded));
        assert_eq!(
            tasks.iter().map(|t| t.order).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_failed_child_aborts_wait() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = StoreDispatcher {
            jobs: jobs.clone(),
            dispatched: Mutex::new(Vec::new()),
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings());
        let failer = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                loop {
                    let pending = jobs.jobs_of_kind(JobKind::RefineSceneAll).await;
                    if let Some(job) = pending.first() {
                        jobs.finish(&job.id, JobOutcome::Failed("render crashed".into()))
                            .await
                            .unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let mut tasks = Vec::new();
        let err = coordinator
            .run(&scenes(2), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .unwrap_err();
        failer.await.unwrap();

        match err {
            CoordinatorError::ChildFailed { reason, .. } => assert_eq!(reason, "render crashed"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(tasks.iter().any(|t| t.status == ChildTaskStatus::Failed));
        assert!(tasks.iter().any(|t| t.status == ChildTaskStatus::Queued));
    }

    #[tokio::test]
    async fn test_timeout_reports_counts() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = StoreDispatcher {
            jobs: jobs.clone(),
            dispatched: Mutex::new(Vec::new()),
        };
        let settings = CoordinatorSettings {
            wait_timeout: Duration::from_millis(20),
            ..settings()
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings);
        let mut tasks = Vec::new();
        let err = coordinator
            .run(&scenes(2), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::Timeout {
                succeeded: 0,
                total: 2
            }
        ));
        assert_eq!(err.to_string(), "scene child tasks timeout (0/2)");
        assert_eq!(dispatcher.dispatched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_children_hit_unknown_limit() {
        let jobs = MemoryJobStore::new();
        let coordinator = SceneChildCoordinator::new(&jobs, &GhostDispatcher, settings());

        let mut tasks = Vec::new();
        let err = coordinator
            .run(&scenes(1), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::ChildUnknown { polls: 3, .. }));
        assert_eq!(tasks[0].status, ChildTaskStatus::Unknown);
    }

    #[tokio::test]
    async fn test_zero_unknown_limit_does_not_abort_succeeded_children() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = InstantDispatcher { jobs: jobs.clone() };
        let settings = CoordinatorSettings {
            unknown_poll_limit: 0,
            ..settings()
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings);
        let mut tasks = Vec::new();
        coordinator
            .run(&scenes(2), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .expect("succeeded children are not unknown");

        assert!(tasks.iter().all(|t| t.status == ChildTaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_dispatch_progress_carries_child_tasks() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = InstantDispatcher { jobs: jobs.clone() };
        let settings = CoordinatorSettings {
            concurrency: 1,
            ..settings()
        };
        let recorder = Arc::new(Recorder::default());

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings);
        let mut tasks = Vec::new();
        coordinator
            .run(&scenes(2), 1, &mut tasks, recorder.clone())
            .await
            .expect("children succeed");

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(updates[0].pct, 15);
        assert_eq!(updates[0].extras["sceneChildTasks"].as_array().unwrap().len(), 1);
        assert_eq!(updates[0].extras["sceneChildStats"]["queued"], 1);
        assert_eq!(updates[1].pct, 30);
        assert_eq!(updates[1].extras["sceneChildStats"]["total"], 2);
        let last = updates.last().unwrap();
        assert_eq!(last.pct, 99);
        assert_eq!(last.extras["sceneChildStats"]["succeeded"], 2);
    }

    #[tokio::test]
    async fn test_cancelled_child_aborts_wait() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = StoreDispatcher {
            jobs: jobs.clone(),
            dispatched: Mutex::new(Vec::new()),
        };

        let canceller = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                loop {
                    let pending = jobs.jobs_of_kind(JobKind::RefineSceneAll).await;
                    if let Some(job) = pending.iter().find(|j| j.payload["sceneId"] == "s2") {
                        jobs.finish(&job.id, JobOutcome::Cancelled).await.unwrap();
                        return job.id.clone();
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings());
        let mut tasks = Vec::new();
        let err = coordinator
            .run(&scenes(2), 1, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .unwrap_err();
        let cancelled_id = canceller.await.unwrap();

        match err {
            CoordinatorError::ChildFailed {
                order,
                job_id,
                reason,
            } => {
                assert_eq!(order, 2);
                assert_eq!(job_id, cancelled_id);
                assert_eq!(reason, "cancelled");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_running_children_are_not_failures() {
        let jobs = Arc::new(MemoryJobStore::new());
        let dispatcher = StoreDispatcher {
            jobs: jobs.clone(),
            dispatched: Mutex::new(Vec::new()),
        };
        let settings = CoordinatorSettings {
            wait_timeout: Duration::from_millis(30),
            ..settings()
        };

        let marker = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                loop {
                    let pending = jobs.jobs_of_kind(JobKind::RefineSceneAll).await;
                    if let Some(job) = pending.first() {
                        jobs.mark_running(&job.id).await.unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let coordinator = SceneChildCoordinator::new(jobs.as_ref(), &dispatcher, settings);
        let mut tasks = Vec::new();
        let err = coordinator
            .run(&scenes(1), 2, &mut tasks, Arc::new(NoopProgressSink))
            .await
            .unwrap_err();
        marker.await.unwrap();

        assert!(matches!(err, CoordinatorError::Timeout { .. }));
        let status = jobs.get_status(&tasks[0].job_id).await.unwrap().unwrap();
        assert_eq!(status.status, Some(JobStatus::Running));
        assert_eq!(tasks[0].chunk, 2);
    }
}
