//! Error types shared across subsystems.
//!
//! Subsystem-specific errors live next to the code that raises them
//! (`AgentError`, `QueueError`, `CoordinatorError`, ...). The two defined
//! here are consumed by several modules:
//! - LLM provider interactions
//! - Persisted episode/scene state reads

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors that can occur while reading or writing persisted domain state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Episode '{0}' not found")]
    EpisodeNotFound(String),

    #[error("Scene '{0}' not found")]
    SceneNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
