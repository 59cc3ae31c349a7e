use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// JSON file holding the persisted daily counter
    #[arg(long, global = true, default_value = "tabflow-state.json")]
    pub store: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed newline-delimited host events through the engine
    Run(Run),
    /// Print today's persisted traffic total
    Daily {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Parser, Clone, Debug)]
pub struct Run {
    /// Event source: a file path, or '-' for stdin
    #[arg(long, default_value = "-")]
    pub input: String,

    /// Seconds between throughput log lines (0 disables)
    #[arg(long, default_value_t = 5)]
    pub report_interval: u64,

    /// Format of the final snapshot
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Bounded queue size between the reader and the ingest thread
    #[arg(long, default_value_t = 1024)]
    pub queue: usize,

    /// Do not log badge updates for the focused tab
    #[arg(long)]
    pub no_badge: bool,

    /// Keep the daily counter in memory only; --store is not touched
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Runtime knobs derived from the command line.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub queue: usize,
    pub report_interval: Option<Duration>,
    pub badge: bool,
}

impl From<&Run> for RuntimeConfig {
    fn from(run: &Run) -> Self {
        Self {
            queue: run.queue.max(1),
            report_interval: (run.report_interval > 0).then(|| Duration::from_secs(run.report_interval)),
            badge: !run.no_badge,
        }
    }
}
