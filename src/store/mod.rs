//! Persisted episode state, as the orchestrator sees it.
//!
//! The orchestrator reads this state through [`EpisodeStore`] to decide
//! whether each stage is already done. Writes belong to the stage
//! executors, which own the storage schema.

pub mod domain;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;

pub use domain::{
    has_scene_list, has_scene_script_draft, is_core_expression_present, pending_refinement,
    pending_sound_and_duration, EpisodeRef, EpisodeSnapshot, SceneScriptDraft, SceneSnapshot,
    SceneStatus, SoundDurationWork,
};
pub use memory::MemoryEpisodeStore;

/// Read-only queries over episode state.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// Load an episode, verifying it belongs to the team's project.
    async fn load_episode(&self, episode: &EpisodeRef) -> Result<EpisodeSnapshot, StoreError>;

    /// The episode's scenes in scene order.
    async fn list_scenes(&self, episode: &EpisodeRef) -> Result<Vec<SceneSnapshot>, StoreError>;
}
