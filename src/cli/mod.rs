//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, RecoverCommand, ResumeCommand, RunCommand};

/// Durable pipeline execution engine
#[derive(Debug, Parser, Clone)]
#[command(name = "conveyor")]
#[command(version = "0.1.0")]
#[command(about = "A durable pipeline execution engine with crash recovery", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run recovery before executing the command
    #[arg(long, global = true)]
    pub auto_recover: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List registered pipelines
    List,

    /// Execute a pipeline once, synchronously
    Run(RunCommand),

    /// Show recently completed runs
    History(HistoryCommand),

    /// Detect interrupted runs and print them
    CheckInterrupted,

    /// Resume a single interrupted run
    Resume(ResumeCommand),

    /// Detect interrupted runs and optionally resume them
    Recover(RecoverCommand),

    /// Start the polling worker
    Worker,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }
}
