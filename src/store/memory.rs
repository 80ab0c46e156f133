//! In-process episode store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::domain::{EpisodeRef, EpisodeSnapshot, SceneScriptDraft, SceneSnapshot, SceneStatus};
use super::EpisodeStore;
use crate::error::StoreError;

#[derive(Default)]
struct State {
    /// `(team_id, project_id)` pairs that exist.
    projects: HashSet<(String, String)>,
    episodes: HashMap<String, EpisodeSnapshot>,
    scenes: HashMap<String, Vec<SceneSnapshot>>,
}

/// Episode store backed by maps, with write helpers for stage executors.
#[derive(Default)]
pub struct MemoryEpisodeStore {
    state: RwLock<State>,
}

impl MemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_project(&self, team_id: &str, project_id: &str) {
        self.state
            .write()
            .await
            .projects
            .insert((team_id.to_string(), project_id.to_string()));
    }

    pub async fn put_episode(&self, episode: EpisodeSnapshot) {
        self.state
            .write()
            .await
            .episodes
            .insert(episode.id.clone(), episode);
    }

    /// Replace an episode's scene list.
    pub async fn put_scenes(&self, episode_id: &str, scenes: Vec<SceneSnapshot>) {
        self.state
            .write()
            .await
            .scenes
            .insert(episode_id.to_string(), scenes);
    }

    pub async fn set_core_expression(
        &self,
        episode_id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let episode = state
            .episodes
            .get_mut(episode_id)
            .ok_or_else(|| StoreError::EpisodeNotFound(episode_id.to_string()))?;
        episode.core_expression = Some(value);
        Ok(())
    }

    pub async fn set_scene_script_draft(
        &self,
        episode_id: &str,
        draft: SceneScriptDraft,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let episode = state
            .episodes
            .get_mut(episode_id)
            .ok_or_else(|| StoreError::EpisodeNotFound(episode_id.to_string()))?;
        episode.scene_script_draft = Some(draft);
        Ok(())
    }

    /// Apply `f` to the scene with `scene_id`, in whichever episode holds it.
    pub async fn update_scene<F>(&self, scene_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SceneSnapshot) + Send,
    {
        let mut state = self.state.write().await;
        let scene = state
            .scenes
            .values_mut()
            .flat_map(|scenes| scenes.iter_mut())
            .find(|scene| scene.id == scene_id)
            .ok_or_else(|| StoreError::SceneNotFound(scene_id.to_string()))?;
        f(scene);
        Ok(())
    }

    pub async fn set_scene_status(
        &self,
        scene_id: &str,
        status: SceneStatus,
    ) -> Result<(), StoreError> {
        self.update_scene(scene_id, |scene| scene.status = status).await
    }

    pub async fn set_sound_design(&self, scene_id: &str, value: Value) -> Result<(), StoreError> {
        self.update_scene(scene_id, |scene| scene.sound_design = Some(value))
            .await
    }

    pub async fn set_duration_estimate(
        &self,
        scene_id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.update_scene(scene_id, |scene| scene.duration_estimate = Some(value))
            .await
    }
}

#[async_trait]
impl EpisodeStore for MemoryEpisodeStore {
    async fn load_episode(&self, episode: &EpisodeRef) -> Result<EpisodeSnapshot, StoreError> {
        let state = self.state.read().await;
        let project_key = (episode.team_id.clone(), episode.project_id.clone());
        if !state.projects.contains(&project_key) {
            return Err(StoreError::ProjectNotFound(episode.project_id.clone()));
        }
        state
            .episodes
            .get(&episode.episode_id)
            .filter(|ep| ep.project_id == episode.project_id)
            .cloned()
            .ok_or_else(|| StoreError::EpisodeNotFound(episode.episode_id.clone()))
    }

    async fn list_scenes(&self, episode: &EpisodeRef) -> Result<Vec<SceneSnapshot>, StoreError> {
        let state = self.state.read().await;
        let mut scenes = state
            .scenes
            .get(&episode.episode_id)
            .cloned()
            .unwrap_or_default();
        scenes.sort_by_key(|scene| scene.order);
        Ok(scenes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryEpisodeStore, EpisodeRef) {
        let store = MemoryEpisodeStore::new();
        store.put_project("team", "proj").await;
        store.put_episode(EpisodeSnapshot::new("ep", "proj", 1)).await;
        store
            .put_scenes(
                "ep",
                vec![
                    SceneSnapshot::new("s2", 2, SceneStatus::Pending),
                    SceneSnapshot::new("s1", 1, SceneStatus::Pending),
                ],
            )
            .await;
        (store, EpisodeRef::new("team", "proj", "ep"))
    }

    #[tokio::test]
    async fn test_load_checks_project_and_episode() {
        let (store, episode) = seeded().await;
        assert!(store.load_episode(&episode).await.is_ok());

        let wrong_team = EpisodeRef::new("other", "proj", "ep");
        assert!(matches!(
            store.load_episode(&wrong_team).await,
            Err(StoreError::ProjectNotFound(_))
        ));

        let missing = EpisodeRef::new("team", "proj", "nope");
        assert!(matches!(
            store.load_episode(&missing).await,
            Err(StoreError::EpisodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scene_writes() {
        let (store, episode) = seeded().await;
        store
            .set_scene_status("s1", SceneStatus::Completed)
            .await
            .expect("status");
        store
            .set_sound_design("s2", json!({"cues": []}))
            .await
            .expect("sound");

        let scenes = store.list_scenes(&episode).await.expect("scenes");
        assert_eq!(scenes[0].id, "s1");
        assert_eq!(scenes[0].status, SceneStatus::Completed);
        assert!(scenes[1].sound_design.is_some());

        assert!(matches!(
            store.set_duration_estimate("ghost", json!(1)).await,
            Err(StoreError::SceneNotFound(_))
        ));
    }
}
