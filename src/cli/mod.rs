//! CLI module for the stack operator.
//!
//! This module provides the command-line interface for running the operator
//! and managing stack resources.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat};
pub use output::OutputFormatter;
