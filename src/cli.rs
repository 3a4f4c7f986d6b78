//! Command-line interface for dubflow
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Dub audio and video files through remote speech services
#[derive(Parser, Debug)]
#[command(
    name = "dubflow",
    version,
    about = "Dub audio and video files through remote speech services"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress progress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`, if any.
    pub fn log_filter(&self) -> Option<&'static str> {
        match (self.quiet, self.verbose) {
            (true, _) => Some("warn"),
            (false, 0) => None,
            (false, 1) => Some("info,dubflow=debug"),
            (false, _) => Some("debug,dubflow=trace"),
        }
    }
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dub one or more files and wait for them to finish
    Run {
        /// Audio or video files to dub
        #[arg(required = true, value_name = "INPUT")]
        inputs: Vec<PathBuf>,

        /// Target language code (en, zh, es, fr, de, ja, ko)
        #[arg(long, short = 't', value_name = "LANG")]
        target: String,

        /// Cancel a job that runs longer than this. Examples: 90s, 10m, 1h30m
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        deadline: Option<Duration>,

        /// Directory for dubbed output (default: orchestrator.output_dir)
        #[arg(long, short = 'o', value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Show one job
    Status {
        /// Job id
        id: String,

        /// Print the job record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded jobs, oldest first
    List,

    /// Remove a job record
    Delete {
        /// Job id
        id: String,
    },

    /// Delete uploaded objects older than a threshold
    Sweep {
        /// Key prefix to sweep (default: storage.prefix)
        #[arg(long, value_name = "PREFIX")]
        prefix: Option<String>,

        /// Only delete objects older than this
        #[arg(long, value_name = "DURATION", default_value = "24h", value_parser = parse_duration)]
        max_age: Duration,
    },

    /// Show configured backends and check their settings
    Providers,

    /// View and create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Print the configuration file path
    Path,
    /// Write a commented starter configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
