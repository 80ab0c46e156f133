//! Planning pass: a short agent loop that inspects the episode before the
//! stages run and decides whether to proceed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{
    AgentLoop, AgentLoopConfig, AgentLoopFailure, AgentTrace, ExecutionMode, FallbackFn,
    FallbackOutcome, FnTool, ModelCaller, ModelResponse, StepContext, ToolError, ToolRegistry,
};
use crate::error::{LlmError, StoreError};
use crate::llm::Message;
use crate::progress::{JobProgress, ProgressSink};
use crate::store::{EpisodeRef, EpisodeStore};

/// Fallback reason recorded when the planning loop fails.
pub const PLANNING_FALLBACK_REASON: &str = "episode_creation_agent_failed_use_legacy";

pub const EPISODE_CONTEXT_TOOL: &str = "read_episode_context";

const PLANNING_BASE_PCT: u8 = 6;
const PLANNING_STEP_PCT: u8 = 2;
const PLANNING_CEILING_PCT: u8 = 12;

const PLANNING_SYSTEM_PROMPT: &str = r#"You are the planning step of an episode creation pipeline.
The pipeline runs five stages in order: core expression, scene script, scene list, scene refinement, sound and duration.
Stages whose output already exists are skipped.

Reply with exactly one JSON object per turn:
- {"kind":"tool_call","toolName":"<name>","toolInput":{...}} to call a tool
- {"kind":"final","final":{"proceed":true}} when the pipeline should run

Call read_episode_context before answering."#;

/// How the planning pass concluded.
#[derive(Debug, Clone)]
pub struct PlanningOutcome {
    pub execution_mode: ExecutionMode,
    pub fallback_used: bool,
    pub trace: AgentTrace,
}

/// Summary of persisted episode state, as returned by the context tool.
pub async fn episode_context(
    store: &dyn EpisodeStore,
    episode: &EpisodeRef,
) -> Result<Value, StoreError> {
    let snapshot = store.load_episode(episode).await?;
    let scenes = store.list_scenes(episode).await?;

    Ok(json!({
        "episodeId": snapshot.id,
        "hasCoreExpression": crate::store::is_core_expression_present(&snapshot),
        "hasSceneScriptDraft": crate::store::has_scene_script_draft(&snapshot),
        "sceneCount": scenes.len(),
        "completedSceneCount": scenes.iter().filter(|s| s.is_refined()).count(),
        "soundReadyCount": scenes.iter().filter(|s| !s.needs_sound_design()).count(),
        "durationReadyCount": scenes.iter().filter(|s| !s.needs_duration_estimate()).count(),
    }))
}

/// Reports planning steps into the run's progress before each model call.
struct PlanningProgressCaller {
    inner: Arc<dyn ModelCaller>,
    progress: Arc<dyn ProgressSink>,
}

#[async_trait]
impl ModelCaller for PlanningProgressCaller {
    async fn call(
        &self,
        messages: &[Message],
        ctx: StepContext,
    ) -> Result<ModelResponse, LlmError> {
        self.progress
            .update(JobProgress::new(
                planning_step_pct(ctx.step_index),
                format!("Episode creation agent planning (step {})", ctx.step_index),
            ))
            .await;
        self.inner.call(messages, ctx).await
    }
}

fn planning_step_pct(step_index: usize) -> u8 {
    let step = u8::try_from(step_index).unwrap_or(u8::MAX);
    PLANNING_BASE_PCT
        .saturating_add(PLANNING_STEP_PCT.saturating_mul(step))
        .min(PLANNING_CEILING_PCT)
}

fn context_tool(store: Arc<dyn EpisodeStore>, episode: EpisodeRef) -> FnTool {
    FnTool::new(
        EPISODE_CONTEXT_TOOL,
        "Read which episode artifacts already exist and how many scenes are done.",
        move |_input, _ctx| {
            let store = store.clone();
            let episode = episode.clone();
            Box::pin(async move {
                episode_context(store.as_ref(), &episode)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
            })
        },
    )
}

fn parse_proceed(value: Value) -> Result<(), String> {
    match value.get("proceed").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        _ => Err("final must be {\"proceed\": true}".to_string()),
    }
}

/// Run the planning loop; on failure the run falls through to legacy mode.
pub async fn run_planning(
    planner: Arc<dyn ModelCaller>,
    config: AgentLoopConfig,
    store: Arc<dyn EpisodeStore>,
    episode: &EpisodeRef,
    progress: Arc<dyn ProgressSink>,
) -> Result<PlanningOutcome, AgentLoopFailure> {
    let caller = Arc::new(PlanningProgressCaller {
        inner: planner,
        progress,
    });
    let tools = ToolRegistry::new().with_tool(Arc::new(context_tool(store, episode.clone())));
    let tools_hint = tools.describe();
    let agent = AgentLoop::new(caller, tools, config);

    let goal = json!({
        "goal": "create the episode",
        "teamId": episode.team_id,
        "projectId": episode.project_id,
        "episodeId": episode.episode_id,
        "tools": tools_hint,
    });
    let messages = vec![
        Message::system(PLANNING_SYSTEM_PROMPT),
        Message::user(goal.to_string()),
    ];

    let fallback: FallbackFn<'_, ()> = Box::new(|_error| {
        Box::pin(async { Ok(FallbackOutcome::new(()).with_reason(PLANNING_FALLBACK_REASON)) })
    });

    let outcome = agent.run(messages, parse_proceed, Some(fallback)).await?;
    Ok(PlanningOutcome {
        execution_mode: outcome.execution_mode,
        fallback_used: outcome.fallback_used,
        trace: outcome.trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EpisodeSnapshot, MemoryEpisodeStore, SceneSnapshot, SceneStatus};

    #[test]
    fn test_planning_step_pct() {
        assert_eq!(planning_step_pct(1), 8);
        assert_eq!(planning_step_pct(3), 12);
        assert_eq!(planning_step_pct(10), 12);
    }

    #[test]
    fn test_parse_proceed() {
        assert!(parse_proceed(json!({"proceed": true})).is_ok());
        assert!(parse_proceed(json!({"proceed": false})).is_err());
        assert!(parse_proceed(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_episode_context_counts() {
        let store = MemoryEpisodeStore::new();
        store.put_project("team", "proj").await;
        store.put_episode(EpisodeSnapshot::new("ep", "proj", 1)).await;
        let mut done = SceneSnapshot::new("s1", 1, SceneStatus::Completed);
        done.sound_design = Some(json!({"cues": []}));
        store
            .put_scenes(
                "ep",
                vec![done, SceneSnapshot::new("s2", 2, SceneStatus::Pending)],
            )
            .await;

        let context = episode_context(&store, &EpisodeRef::new("team", "proj", "ep"))
            .await
            .expect("context");
        assert_eq!(context["hasCoreExpression"], false);
        assert_eq!(context["sceneCount"], 2);
        assert_eq!(context["completedSceneCount"], 1);
        assert_eq!(context["soundReadyCount"], 1);
        assert_eq!(context["durationReadyCount"], 0);
    }
}
