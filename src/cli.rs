//! Command-line interface for streamscribe
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Live-stream speech transcription with speaker diarization
#[derive(Parser, Debug)]
#[command(
    name = "streamscribe",
    version,
    about = "Live-stream speech transcription with speaker diarization"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the transcription service (foreground process)
    Run {
        /// Channel id for the initial channel
        #[arg(long, value_name = "ID", default_value = "default")]
        channel: String,

        /// Transports to ingest on (srt, rtmp, websocket); repeatable
        #[arg(long, value_name = "TRANSPORT", default_values = ["srt"])]
        transport: Vec<String>,
    },

    /// Ingestion worker subprocess (spawned internally, not for direct use)
    #[command(hide = true)]
    Worker {
        /// Transport this worker terminates (srt, rtmp, websocket)
        #[arg(long, value_name = "TRANSPORT")]
        transport: String,
    },

    /// Inspect configuration
    Config {
        /// Action to perform
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration inspection actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path in use
    Path,
}
