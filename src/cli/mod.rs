//! Command-line interface for clone-forge.
//!
//! Provides commands for running built-in clones through a local runtime and
//! for inspecting registered types and persisted snapshots.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, CloneKind, Commands};
