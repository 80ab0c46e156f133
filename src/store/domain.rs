//! Typed episode/scene snapshots and stage completion predicates.
//!
//! The predicates are pure reads of persisted state. They are the only
//! record of "is this stage done", so re-running the pipeline is always
//! safe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies an episode within a team's project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRef {
    pub team_id: String,
    pub project_id: String,
    pub episode_id: String,
}

impl EpisodeRef {
    pub fn new(
        team_id: impl Into<String>,
        project_id: impl Into<String>,
        episode_id: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            project_id: project_id.into(),
            episode_id: episode_id.into(),
        }
    }
}

/// A scene script draft is either free text or a list of sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SceneScriptDraft {
    Text(String),
    Sections(Vec<Value>),
}

impl SceneScriptDraft {
    pub fn is_empty(&self) -> bool {
        match self {
            SceneScriptDraft::Text(text) => text.trim().is_empty(),
            SceneScriptDraft::Sections(sections) => sections.is_empty(),
        }
    }
}

/// Episode fields the pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeSnapshot {
    pub id: String,
    pub project_id: String,
    pub order: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub core_expression: Option<Value>,
    #[serde(default)]
    pub scene_script_draft: Option<SceneScriptDraft>,
}

impl EpisodeSnapshot {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            order,
            title: String::new(),
            summary: String::new(),
            core_expression: None,
            scene_script_draft: None,
        }
    }
}

/// Workflow state of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Pending,
    SceneGenerating,
    SceneConfirmed,
    KeyframeGenerating,
    KeyframeConfirmed,
    MotionGenerating,
    SoundDesignGenerating,
    SoundDesignConfirmed,
    Completed,
    NeedsUpdate,
}

/// Scene fields the pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub id: String,
    pub order: u32,
    pub status: SceneStatus,
    #[serde(default)]
    pub sound_design: Option<Value>,
    #[serde(default)]
    pub duration_estimate: Option<Value>,
}

impl SceneSnapshot {
    pub fn new(id: impl Into<String>, order: u32, status: SceneStatus) -> Self {
        Self {
            id: id.into(),
            order,
            status,
            sound_design: None,
            duration_estimate: None,
        }
    }

    pub fn is_refined(&self) -> bool {
        self.status == SceneStatus::Completed
    }

    pub fn needs_sound_design(&self) -> bool {
        self.sound_design.is_none()
    }

    pub fn needs_duration_estimate(&self) -> bool {
        self.duration_estimate.is_none()
    }
}

/// Sound/duration work still owed for one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundDurationWork {
    pub scene: SceneSnapshot,
    pub need_sound: bool,
    pub need_duration: bool,
}

impl SoundDurationWork {
    /// Number of executor calls this scene needs (1 or 2).
    pub fn units(&self) -> usize {
        usize::from(self.need_sound) + usize::from(self.need_duration)
    }
}

/// core_expression is done when a non-null document exists.
pub fn is_core_expression_present(episode: &EpisodeSnapshot) -> bool {
    matches!(&episode.core_expression, Some(v) if !v.is_null())
}

/// scene_script is done when the draft has content.
pub fn has_scene_script_draft(episode: &EpisodeSnapshot) -> bool {
    episode
        .scene_script_draft
        .as_ref()
        .is_some_and(|draft| !draft.is_empty())
}

/// scene_list is done when at least one scene exists.
pub fn has_scene_list(scenes: &[SceneSnapshot]) -> bool {
    !scenes.is_empty()
}

/// Scenes not yet refined, in scene order.
pub fn pending_refinement(scenes: &[SceneSnapshot]) -> Vec<SceneSnapshot> {
    let mut pending: Vec<SceneSnapshot> = scenes
        .iter()
        .filter(|s| !s.is_refined())
        .cloned()
        .collect();
    pending.sort_by_key(|s| s.order);
    pending
}

/// Scenes missing a sound design or duration estimate, in scene order.
pub fn pending_sound_and_duration(scenes: &[SceneSnapshot]) -> Vec<SoundDurationWork> {
    let mut work: Vec<SoundDurationWork> = scenes
        .iter()
        .map(|scene| SoundDurationWork {
            scene: scene.clone(),
            need_sound: scene.needs_sound_design(),
            need_duration: scene.needs_duration_estimate(),
        })
        .filter(|w| w.need_sound || w.need_duration)
        .collect();
    work.sort_by_key(|w| w.scene.order);
    work
}
