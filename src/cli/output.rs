//! CLI output formatting

use crate::persistence::{PipelineRecord, RunRecord, RunStatus};
use crate::recovery::InterruptedRun;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Success => style("SUCCESS").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// One-line summary of a completed run
pub fn format_run_line(run: &RunRecord, pipeline: &PipelineRecord) -> String {
    let status_icon = match run.status {
        RunStatus::Success => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    };

    let duration = run
        .finished_at
        .and_then(|finished| (finished - run.started_at).to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} - started {} ({})",
        status_icon,
        style(&run.id.to_string()[..8]).dim(),
        style(&pipeline.name).bold(),
        format_status(run.status),
        style(run.started_at.format("%Y-%m-%d %H:%M:%S").to_string()).dim(),
        style(duration).cyan(),
    )
}

/// One-line summary of a detected interrupted run
pub fn format_interrupted_line(interrupted: &InterruptedRun) -> String {
    let next = interrupted
        .next_step_to_execute
        .as_deref()
        .unwrap_or("<none>");
    format!(
        "{} {} - {} - stalled since {} - {} done, {} failed, next: {}",
        WARN,
        style(&interrupted.run_id.to_string()[..8]).dim(),
        style(&interrupted.pipeline_name).bold(),
        style(
            interrupted
                .started_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        )
        .dim(),
        style(interrupted.completed_steps.len()).green(),
        style(interrupted.failed_steps.len()).red(),
        style(next).cyan(),
    )
}

/// Human-readable duration
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 1 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
