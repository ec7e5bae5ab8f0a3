use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `fleetpilot` - unattended supervisor for fleets of coding-agent subprocesses.
#[derive(Parser, Debug)]
#[command(name = "fleetpilot")]
#[command(version)]
#[command(about = "Run coding agents unattended, answering their confirmation prompts by policy.", long_about = None)]
pub struct Cli {
    /// Config file (default: <config_dir>/fleetpilot/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run tasks through the worker pool and print their results
    Run {
        /// Task description (repeatable)
        #[arg(short, long = "task")]
        tasks: Vec<String>,

        /// File with one task description per line
        #[arg(long)]
        tasks_file: Option<PathBuf>,

        /// Override pool.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a directory of policy rule files
    CheckRules {
        /// Directory containing *.toml rule files
        dir: PathBuf,

        /// Skip the built-in rules
        #[arg(long)]
        no_builtin: bool,
    },

    /// Show the most recent decisions from the audit log
    Audit {
        /// Number of decisions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Audit log to read (default: audit.log_path)
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Recompute decision metrics from the audit log
    Metrics {
        /// Audit log to read (default: audit.log_path)
        #[arg(long)]
        log: Option<PathBuf>,
    },
}
