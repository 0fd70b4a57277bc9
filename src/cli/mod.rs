//! Command-line interface for discovery-forge.
//!
//! Provides commands for running and resuming discovery runs, probing the
//! completion service and inspecting saved checkpoints.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
