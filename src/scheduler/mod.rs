//! Job model and job stores.
//!
//! This module provides the job plumbing the orchestrator runs on:
//!
//! - **Job**: a queued unit of work with status, progress and outcome
//! - **JobControl**: the narrow queue interface the orchestrator consumes
//! - **MemoryJobStore**: in-process store for tests and local runs
//! - **RedisJobStore**: shared store backed by Redis
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────────┐        ┌───────────────────┐
//!    │   Producer   │ enqueue│   Job store       │
//!    │  (API/CLI)   ├───────►│  (Redis / memory) │
//!    └──────────────┘        └─────────┬─────────┘
//!                                      │ status / progress / outcome
//!                     ┌────────────────┼────────────────┐
//!                     ▼                ▼                ▼
//!              ┌────────────┐   ┌────────────┐   ┌────────────┐
//!              │ episode    │   │ scene      │   │ scene      │
//!              │ job (chunk)│   │ child job  │   │ child job  │
//!              └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! Retry and backoff belong to the queue transport, not to this module.

pub mod control;
pub mod job;
pub mod memory;
pub mod redis_store;

// Re-export main types for convenience
pub use control::{JobControl, JobProgressSink, JobStatusReport, QueueError};
pub use job::{Job, JobKind, JobOutcome, JobStatus};
pub use memory::MemoryJobStore;
pub use redis_store::{RedisJobStore, DEFAULT_KEY_PREFIX};
