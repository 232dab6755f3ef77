//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stack operator - drives declared stacks to their desired state.
#[derive(Parser, Debug)]
#[command(name = "stack-operator")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACK_OPERATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "STACK_OPERATOR_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller and the follower until interrupted.
    Run {
        /// Log mutations instead of performing them.
        #[arg(long)]
        dry_run: bool,

        /// AWS region, overriding the configuration.
        #[arg(long, env = "AWS_REGION")]
        region: Option<String>,
    },

    /// Create a stack resource or update its spec from a manifest.
    Apply {
        /// Path to the stack manifest.
        file: PathBuf,
    },

    /// Request deletion of a stack resource.
    Delete {
        /// Resource as `<namespace>/<name>` or `<name>`.
        locator: String,
    },

    /// Show a stack resource.
    Get {
        /// Resource as `<namespace>/<name>` or `<name>`.
        locator: String,
    },

    /// List stack resources.
    List,

    /// Validate the operator configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["stack-operator", "run", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { dry_run: true, .. }));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stack-operator",
            "get",
            "prod/web",
            "--output",
            "json",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Get { ref locator } if locator == "prod/web"));
    }

    #[test]
    fn test_apply_requires_file() {
        assert!(Cli::try_parse_from(["stack-operator", "apply"]).is_err());
    }
}
