//! Queue-backed hooks: per-scene child dispatch and chunk continuation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scheduler::{JobControl, JobKind, QueueError};
use crate::store::{EpisodeRef, SceneSnapshot};

/// Payload of a `run_episode_creation_agent` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeJobPayload {
    pub team_id: String,
    pub project_id: String,
    pub episode_id: String,
    /// 1-based chunk index; absent means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_concurrency: Option<usize>,
    /// Fan scene refinement out to `refine_scene_all` child jobs.
    #[serde(default)]
    pub use_scene_child_jobs: bool,
    /// Job that enqueued this one as its continuation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
}

impl EpisodeJobPayload {
    pub fn new(episode: &EpisodeRef) -> Self {
        Self {
            team_id: episode.team_id.clone(),
            project_id: episode.project_id.clone(),
            episode_id: episode.episode_id.clone(),
            chunk: None,
            scene_chunk_size: None,
            scene_concurrency: None,
            use_scene_child_jobs: false,
            parent_job_id: None,
        }
    }

    pub fn episode(&self) -> EpisodeRef {
        EpisodeRef::new(&self.team_id, &self.project_id, &self.episode_id)
    }

    pub fn chunk(&self) -> u32 {
        self.chunk.unwrap_or(1).max(1)
    }

    /// The payload of the next chunk's job, enqueued by `parent_job_id`.
    pub fn continuation(&self, parent_job_id: Option<&str>) -> Self {
        Self {
            chunk: Some(self.chunk() + 1),
            parent_job_id: parent_job_id.map(str::to_string),
            ..self.clone()
        }
    }
}

/// Payload of a `refine_scene_all` child job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneJobPayload {
    pub team_id: String,
    pub project_id: String,
    pub episode_id: String,
    pub scene_id: String,
    pub scene_order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
}

/// Starts one child job per scene.
#[async_trait]
pub trait SceneTaskDispatcher: Send + Sync {
    /// Enqueue full refinement of `scene`; returns the child job id.
    async fn dispatch(&self, scene: &SceneSnapshot) -> Result<String, QueueError>;
}

/// Enqueues the next chunk of the current run.
#[async_trait]
pub trait ContinuationEnqueuer: Send + Sync {
    async fn enqueue_continuation(&self) -> Result<String, QueueError>;
}

/// Dispatches `refine_scene_all` jobs through [`JobControl`].
pub struct QueueSceneDispatcher {
    jobs: Arc<dyn JobControl>,
    episode: EpisodeRef,
    parent_job_id: Option<String>,
}

impl QueueSceneDispatcher {
    pub fn new(jobs: Arc<dyn JobControl>, episode: EpisodeRef) -> Self {
        Self {
            jobs,
            episode,
            parent_job_id: None,
        }
    }

    pub fn with_parent_job(mut self, job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(job_id.into());
        self
    }
}

#[async_trait]
impl SceneTaskDispatcher for QueueSceneDispatcher {
    async fn dispatch(&self, scene: &SceneSnapshot) -> Result<String, QueueError> {
        let payload = SceneJobPayload {
            team_id: self.episode.team_id.clone(),
            project_id: self.episode.project_id.clone(),
            episode_id: self.episode.episode_id.clone(),
            scene_id: scene.id.clone(),
            scene_order: scene.order,
            parent_job_id: self.parent_job_id.clone(),
        };
        let job_id = self
            .jobs
            .enqueue(JobKind::RefineSceneAll, serde_json::to_value(&payload)?)
            .await?;
        tracing::debug!(
            scene_id = %scene.id,
            order = scene.order,
            job_id = %job_id,
            "Dispatched scene child job"
        );
        Ok(job_id)
    }
}

/// Enqueues the next `run_episode_creation_agent` chunk through [`JobControl`].
pub struct QueueContinuation {
    jobs: Arc<dyn JobControl>,
    payload: EpisodeJobPayload,
    current_job_id: Option<String>,
}

impl QueueContinuation {
    pub fn new(jobs: Arc<dyn JobControl>, payload: EpisodeJobPayload) -> Self {
        Self {
            jobs,
            payload,
            current_job_id: None,
        }
    }

    pub fn with_current_job(mut self, job_id: impl Into<String>) -> Self {
        self.current_job_id = Some(job_id.into());
        self
    }
}

#[async_trait]
impl ContinuationEnqueuer for QueueContinuation {
    async fn enqueue_continuation(&self) -> Result<String, QueueError> {
        let next = self.payload.continuation(self.current_job_id.as_deref());
        let chunk = next.chunk();
        let job_id = self
            .jobs
            .enqueue(JobKind::RunEpisodeCreationAgent, serde_json::to_value(&next)?)
            .await?;
        tracing::info!(
            episode_id = %next.episode_id,
            chunk,
            job_id = %job_id,
            "Enqueued episode creation continuation"
        );
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryJobStore;
    use crate::store::SceneStatus;

    fn episode() -> EpisodeRef {
        EpisodeRef::new("team", "proj", "ep")
    }

    #[test]
    fn test_payload_defaults() {
        let payload: EpisodeJobPayload = serde_json::from_value(serde_json::json!({
            "teamId": "team",
            "projectId": "proj",
            "episodeId": "ep"
        }))
        .expect("payload parses");
        assert_eq!(payload.chunk(), 1);
        assert!(!payload.use_scene_child_jobs);
        assert_eq!(payload.episode(), episode());
    }

    #[test]
    fn test_continuation_payload() {
        let mut payload = EpisodeJobPayload::new(&episode());
        payload.scene_chunk_size = Some(3);
        let next = payload.continuation(Some("job-1"));
        assert_eq!(next.chunk, Some(2));
        assert_eq!(next.scene_chunk_size, Some(3));
        assert_eq!(next.parent_job_id.as_deref(), Some("job-1"));
        assert_eq!(next.continuation(None).chunk(), 3);
    }

    #[tokio::test]
    async fn test_queue_continuation_enqueues_next_chunk() {
        let store = Arc::new(MemoryJobStore::new());
        let enqueuer = QueueContinuation::new(store.clone(), EpisodeJobPayload::new(&episode()))
            .with_current_job("job-1");

        let job_id = enqueuer.enqueue_continuation().await.expect("enqueue");
        let job = store.get_job(&job_id).await.expect("get").expect("exists");
        assert_eq!(job.kind, JobKind::RunEpisodeCreationAgent);
        assert_eq!(job.payload["chunk"], 2);
        assert_eq!(job.payload["parentJobId"], "job-1");
        assert_eq!(job.episode_id.as_deref(), Some("ep"));
    }

    #[tokio::test]
    async fn test_queue_dispatcher_enqueues_scene_job() {
        let store = Arc::new(MemoryJobStore::new());
        let dispatcher = QueueSceneDispatcher::new(store.clone(), episode()).with_parent_job("p");

        let scene = SceneSnapshot::new("s3", 3, SceneStatus::Pending);
        let job_id = dispatcher.dispatch(&scene).await.expect("dispatch");
        let job = store.get_job(&job_id).await.expect("get").expect("exists");
        assert_eq!(job.kind, JobKind::RefineSceneAll);
        assert_eq!(job.payload["sceneId"], "s3");
        assert_eq!(job.payload["sceneOrder"], 3);
        assert_eq!(job.payload["parentJobId"], "p");
    }
}
