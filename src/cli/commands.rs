//! CLI command definitions

use clap::Args;
use uuid::Uuid;

/// Execute a pipeline once
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Registered pipeline name
    pub name: String,

    /// Recorded as the run's trigger
    #[arg(long, default_value = "cli")]
    pub triggered_by: String,

    /// JSON metadata attached to the run
    #[arg(long)]
    pub metadata: Option<String>,
}

/// Show recently completed runs
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short = 'n', long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Resume one interrupted run
#[derive(Debug, Args, Clone)]
pub struct ResumeCommand {
    /// Run id to resume
    pub run_id: Uuid,
}

/// Recover interrupted runs
#[derive(Debug, Args, Clone)]
pub struct RecoverCommand {
    /// Resume detected runs instead of only listing them
    #[arg(long)]
    pub auto_resume: bool,
}
