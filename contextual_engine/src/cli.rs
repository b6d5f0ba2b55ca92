//! Command-line interface definitions using clap derive API.

use crate::types::ComplexityLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Contextual reasoning engine CLI
#[derive(Parser)]
#[command(name = "contextual-cli")]
#[command(about = "Adaptive multi-subsystem reasoning over queries and context")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to ./contextual.{toml,yaml,json} when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reason about a single query
    Reason {
        query: String,
        /// Context as a JSON object, e.g. '{"domain":"law"}'
        #[arg(long)]
        context: Option<String>,
        /// Force a complexity level instead of assessing it
        #[arg(long)]
        level: Option<ComplexityLevel>,
        /// Stream trace entries as they complete
        #[arg(long)]
        stream: bool,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a batch job from configuration file
    Batch {
        /// Path to the batch configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print engine status as JSON
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reason_arguments() {
        let cli = Cli::parse_from([
            "contextual-cli",
            "reason",
            "what is a monad",
            "--level",
            "neural-system",
            "--context",
            r#"{"domain":"math"}"#,
        ]);
        match cli.command {
            Commands::Reason { query, level, context, .. } => {
                assert_eq!(query, "what is a monad");
                assert_eq!(level, Some(ComplexityLevel::NeuralSystem));
                assert!(context.is_some());
            }
            _ => panic!("expected reason command"),
        }
    }
}
