//! episode-forge: staged episode creation orchestration.
//!
//! This library drives the five-stage episode creation pipeline (core
//! expression, scene script, scene list, scene refinement, sound and
//! duration) as resumable, chunked jobs, with an optional planning agent
//! loop and per-scene child job fan-out.

// Core modules
pub mod agent;
pub mod cli;
pub mod concurrency;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used error types
pub use error::{LlmError, StoreError};
