//! Command-line interface for episode-forge.
//!
//! Provides commands for enqueueing episode creation jobs, inspecting their
//! progress, and probing the model endpoint.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
