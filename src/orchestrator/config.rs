//! Orchestrator configuration.
//!
//! Passed explicitly to [`super::EpisodeCreationOrchestrator::new`]; nothing
//! in the orchestrator reads process-wide flags.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentLoopConfig;

/// Scenes handled per chunk by default.
pub const DEFAULT_SCENE_CHUNK_SIZE: usize = 2;
/// Scenes refined or dispatched concurrently by default.
pub const DEFAULT_SCENE_CONCURRENCY: usize = 2;
/// Deadline for a chunk's child jobs to finish.
pub const DEFAULT_CHILD_WAIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Sleep between child status polls.
pub const DEFAULT_CHILD_POLL_INTERVAL: Duration = Duration::from_millis(800);
/// Consecutive `unknown` polls tolerated per child.
pub const DEFAULT_CHILD_UNKNOWN_POLL_LIMIT: u32 = 10;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the episode creation orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Run the agent planning pass before the stages.
    pub agent_enabled: bool,
    /// Limits and fallback policy for the planning pass.
    pub agent: AgentLoopConfig,
    pub scene_chunk_size: usize,
    pub scene_concurrency: usize,
    pub child_wait_timeout: Duration,
    pub child_poll_interval: Duration,
    pub child_unknown_poll_limit: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_enabled: true,
            agent: AgentLoopConfig::default(),
            scene_chunk_size: DEFAULT_SCENE_CHUNK_SIZE,
            scene_concurrency: DEFAULT_SCENE_CONCURRENCY,
            child_wait_timeout: DEFAULT_CHILD_WAIT_TIMEOUT,
            child_poll_interval: DEFAULT_CHILD_POLL_INTERVAL,
            child_unknown_poll_limit: DEFAULT_CHILD_UNKNOWN_POLL_LIMIT,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AI_AGENT_EPISODE_CREATION_ENABLED`: run the planning pass (default: true)
    /// - `AI_AGENT_FALLBACK_TO_LEGACY`: fall back when the agent fails (default: true)
    /// - `AI_AGENT_MAX_STEPS`: planning step limit (default: 6)
    /// - `AI_AGENT_STEP_TIMEOUT_MS`: per-step budget (default: 45000)
    /// - `AI_AGENT_TOTAL_TIMEOUT_MS`: planning budget (default: 180000)
    /// - `EPISODE_SCENE_CHUNK_SIZE`: scenes per chunk (default: 2)
    /// - `EPISODE_SCENE_CONCURRENCY`: scenes in flight (default: 2)
    /// - `EPISODE_CHILD_WAIT_TIMEOUT_MS`: child job deadline (default: 1200000)
    /// - `EPISODE_CHILD_POLL_INTERVAL_MS`: child poll interval (default: 800)
    /// - `EPISODE_CHILD_UNKNOWN_POLL_LIMIT`: tolerated unknown polls (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`OrchestratorConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("AI_AGENT_EPISODE_CREATION_ENABLED") {
            config.agent_enabled = parse_env_bool(&val, "AI_AGENT_EPISODE_CREATION_ENABLED")?;
        }

        if let Some(val) = lookup("AI_AGENT_FALLBACK_TO_LEGACY") {
            config.agent.fallback_enabled = parse_env_bool(&val, "AI_AGENT_FALLBACK_TO_LEGACY")?;
        }

        if let Some(val) = lookup("AI_AGENT_MAX_STEPS") {
            config.agent.max_steps = parse_env_value(&val, "AI_AGENT_MAX_STEPS")?;
        }

        if let Some(val) = lookup("AI_AGENT_STEP_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "AI_AGENT_STEP_TIMEOUT_MS")?;
            config.agent.step_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("AI_AGENT_TOTAL_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "AI_AGENT_TOTAL_TIMEOUT_MS")?;
            config.agent.total_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("EPISODE_SCENE_CHUNK_SIZE") {
            config.scene_chunk_size = parse_env_value(&val, "EPISODE_SCENE_CHUNK_SIZE")?;
        }

        if let Some(val) = lookup("EPISODE_SCENE_CONCURRENCY") {
            config.scene_concurrency = parse_env_value(&val, "EPISODE_SCENE_CONCURRENCY")?;
        }

        if let Some(val) = lookup("EPISODE_CHILD_WAIT_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "EPISODE_CHILD_WAIT_TIMEOUT_MS")?;
            config.child_wait_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("EPISODE_CHILD_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "EPISODE_CHILD_POLL_INTERVAL_MS")?;
            config.child_poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("EPISODE_CHILD_UNKNOWN_POLL_LIMIT") {
            config.child_unknown_poll_limit =
                parse_env_value(&val, "EPISODE_CHILD_UNKNOWN_POLL_LIMIT")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationFailed(
                "agent max_steps must be greater than 0".to_string(),
            ));
        }

        if self.agent.step_timeout.is_zero() || self.agent.total_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "agent timeouts must be greater than 0".to_string(),
            ));
        }

        if self.scene_chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "scene_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.scene_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "scene_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.child_unknown_poll_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "child_unknown_poll_limit must be greater than 0".to_string(),
            ));
        }

        if self.child_wait_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "child_wait_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_agent_enabled(mut self, enabled: bool) -> Self {
        self.agent_enabled = enabled;
        self
    }

    pub fn with_agent(mut self, agent: AgentLoopConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.agent.fallback_enabled = enabled;
        self
    }

    pub fn with_scene_chunk_size(mut self, size: usize) -> Self {
        self.scene_chunk_size = size;
        self
    }

    pub fn with_scene_concurrency(mut self, concurrency: usize) -> Self {
        self.scene_concurrency = concurrency;
        self
    }

    pub fn with_child_wait_timeout(mut self, timeout: Duration) -> Self {
        self.child_wait_timeout = timeout;
        self
    }

    pub fn with_child_poll_interval(mut self, interval: Duration) -> Self {
        self.child_poll_interval = interval;
        self
    }

    pub fn with_child_unknown_poll_limit(mut self, limit: u32) -> Self {
        self.child_unknown_poll_limit = limit;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.agent_enabled);
        assert!(config.agent.fallback_enabled);
        assert_eq!(config.agent.max_steps, 6);
        assert_eq!(config.agent.step_timeout, Duration::from_millis(45_000));
        assert_eq!(config.agent.total_timeout, Duration::from_millis(180_000));
        assert_eq!(config.scene_chunk_size, 2);
        assert_eq!(config.scene_concurrency, 2);
        assert_eq!(config.child_wait_timeout, Duration::from_secs(1200));
        assert_eq!(config.child_poll_interval, Duration::from_millis(800));
        assert_eq!(config.child_unknown_poll_limit, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("AI_AGENT_EPISODE_CREATION_ENABLED", "off"),
            ("AI_AGENT_FALLBACK_TO_LEGACY", "0"),
            ("AI_AGENT_MAX_STEPS", "3"),
            ("AI_AGENT_STEP_TIMEOUT_MS", "1000"),
            ("EPISODE_SCENE_CHUNK_SIZE", " 4 "),
            ("EPISODE_CHILD_POLL_INTERVAL_MS", "50"),
        ]))
        .expect("valid");

        assert!(!config.agent_enabled);
        assert!(!config.agent.fallback_enabled);
        assert_eq!(config.agent.max_steps, 3);
        assert_eq!(config.agent.step_timeout, Duration::from_secs(1));
        assert_eq!(config.scene_chunk_size, 4);
        assert_eq!(config.child_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_values() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "AI_AGENT_FALLBACK_TO_LEGACY",
            "maybe",
        )]))
        .expect_err("bad bool");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "AI_AGENT_FALLBACK_TO_LEGACY"
        ));

        let err =
            OrchestratorConfig::from_lookup(lookup_from(&[("EPISODE_SCENE_CHUNK_SIZE", "0")]))
                .expect_err("zero chunk");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "EPISODE_CHILD_UNKNOWN_POLL_LIMIT",
            "0",
        )]))
        .expect_err("zero unknown limit");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
        assert!(OrchestratorConfig::default()
            .with_child_unknown_poll_limit(0)
            .validate()
            .is_err());
    }
}
