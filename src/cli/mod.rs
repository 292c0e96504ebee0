//! Command-line interface for droid-bench.
//!
//! Provides the session runner, the evaluator-subprocess entry point, and
//! the execution summary report.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
