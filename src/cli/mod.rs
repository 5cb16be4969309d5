//! Command-line interface for fixbench.
//!
//! Provides the `run`, `validate` and `list` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
