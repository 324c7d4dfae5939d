use anyhow::{Context, Result};
use conveyor::cli::commands::{HistoryCommand, RecoverCommand, ResumeCommand, RunCommand};
use conveyor::cli::output::*;
use conveyor::cli::{Cli, Command};
use conveyor::core::loader::{self, StaticLoader};
use conveyor::persistence::SqliteStore;
use conveyor::{
    PipelineDefinition, PipelineRegistry, PipelineStore, RecoveryOrchestrator, RunExecutor,
    RunOptions, StepDefinition, StepResult, Worker, WorkerConfig,
};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Load pipelines into the registry
    let registry = Arc::new(PipelineRegistry::new());
    let loader = StaticLoader::new(demo_pipelines());
    loader::load_pipelines(&registry, &loader).context("Failed to load pipelines")?;

    let store = open_store().await?;

    if cli.auto_recover {
        let orchestrator = RecoveryOrchestrator::new(store.clone(), registry.clone());
        let report = orchestrator.recover_interrupted_runs().await?;
        if report.detected > 0 {
            println!(
                "{} Startup recovery: {} detected, {} recovered, {} failed",
                INFO,
                report.detected,
                style(report.recovered).green(),
                style(report.failed).red()
            );
        }
    }

    // Execute command
    match &cli.command {
        Command::List => list_pipelines(&registry),
        Command::Run(cmd) => run_pipeline(cmd, store, registry).await?,
        Command::History(cmd) => show_history(cmd, store).await?,
        Command::CheckInterrupted => check_interrupted(store, registry).await?,
        Command::Resume(cmd) => resume_run(cmd, store, registry).await?,
        Command::Recover(cmd) => recover(cmd, store, registry).await?,
        Command::Worker => run_worker(store, registry).await?,
    }

    Ok(())
}

/// Open the store from `DATABASE_URL`, falling back to the per-user
/// default path for local CLI use.
async fn open_store() -> Result<Arc<dyn PipelineStore>> {
    let store = match std::env::var("DATABASE_URL") {
        Ok(url) => SqliteStore::new(&url).await?,
        Err(_) => SqliteStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

fn list_pipelines(registry: &PipelineRegistry) {
    let names = registry.list();
    if names.is_empty() {
        println!("{} No pipelines registered", INFO);
        return;
    }

    println!("{} Registered pipelines:", INFO);
    for name in names {
        if let Some(definition) = registry.get(&name) {
            println!(
                "  {} ({} steps){}",
                style(&name).bold(),
                style(definition.steps.len()).cyan(),
                definition
                    .description
                    .as_deref()
                    .map(|d| format!(" - {}", style(d).dim()))
                    .unwrap_or_default()
            );
        }
    }
}

async fn run_pipeline(
    cmd: &RunCommand,
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
) -> Result<()> {
    let metadata = cmd
        .metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--metadata must be valid JSON")?;

    let executor = RunExecutor::new(store, registry.clone())
        .with_retry_delay_multiplier(conveyor::worker::config::retry_delay_multiplier_from_env()?);

    let mut options = RunOptions::new(&cmd.name).triggered_by(&cmd.triggered_by);
    if let Some(metadata) = metadata {
        options = options.metadata(metadata);
    }

    println!("{} Executing pipeline {}", ROCKET, style(&cmd.name).bold());
    let outcome = match executor.execute(options).await {
        Ok(outcome) => outcome,
        Err(conveyor::ExecutionError::PipelineNotFound(name)) => {
            println!("{} Pipeline {} is not registered", CROSS, style(&name).bold());
            println!("  Available: {}", registry.list().join(", "));
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    for (name, result) in &outcome.step_results {
        match result.data() {
            Some(data) => println!("  {} {} = {}", CHECK, style(name).cyan(), style(data).dim()),
            None => println!("  {} {}", CHECK, style(name).cyan()),
        }
    }

    if outcome.success {
        println!(
            "\n{} {} completed {} in {}",
            CHECK,
            style(&cmd.name).bold(),
            style("successfully").green(),
            format_duration(outcome.duration)
        );
        println!("  Run id: {}", style(outcome.run_id).dim());
        Ok(())
    } else {
        println!(
            "\n{} {} {}: {}",
            CROSS,
            style(&cmd.name).bold(),
            style("failed").red(),
            outcome.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
}

async fn show_history(cmd: &HistoryCommand, store: Arc<dyn PipelineStore>) -> Result<()> {
    let completed = store
        .find_recent_completed(cmd.limit, cmd.pipeline.as_deref())
        .await?;

    if completed.is_empty() {
        println!("{} No completed runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let runs: Vec<_> = completed.iter().map(|(run, _)| run).collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "runs": runs }))?);
        return Ok(());
    }

    println!("{} Recent runs (latest {}):", INFO, cmd.limit);
    for (run, pipeline) in &completed {
        println!("  {}", format_run_line(run, pipeline));
    }
    Ok(())
}

async fn check_interrupted(
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
) -> Result<()> {
    let orchestrator = RecoveryOrchestrator::new(store, registry);
    let interrupted = orchestrator.detect_interrupted().await?;

    if interrupted.is_empty() {
        println!("{} No interrupted runs", CHECK);
        return Ok(());
    }

    println!("{} {} interrupted run(s):", WARN, interrupted.len());
    for run in &interrupted {
        println!("  {}", format_interrupted_line(run));
    }
    Ok(())
}

async fn resume_run(
    cmd: &ResumeCommand,
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
) -> Result<()> {
    let orchestrator = RecoveryOrchestrator::new(store, registry)
        .with_retry_delay_multiplier(conveyor::worker::config::retry_delay_multiplier_from_env()?);
    let outcome = orchestrator.resume_run(cmd.run_id).await?;

    if outcome.success {
        println!(
            "{} Run {} resumed: {} step(s) executed",
            CHECK,
            style(&cmd.run_id.to_string()[..8]).dim(),
            style(outcome.steps_executed).cyan()
        );
        Ok(())
    } else {
        println!(
            "{} Resume refused: {}",
            CROSS,
            outcome.error.as_deref().unwrap_or("unknown reason")
        );
        std::process::exit(1);
    }
}

async fn recover(
    cmd: &RecoverCommand,
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
) -> Result<()> {
    let orchestrator = RecoveryOrchestrator::new(store, registry)
        .with_retry_delay_multiplier(conveyor::worker::config::retry_delay_multiplier_from_env()?);

    if !cmd.auto_resume {
        let interrupted = orchestrator.detect_interrupted().await?;
        println!(
            "{} {} interrupted run(s) detected (use --auto-resume to resume)",
            INFO,
            interrupted.len()
        );
        for run in &interrupted {
            println!("  {}", format_interrupted_line(run));
        }
        return Ok(());
    }

    let report = orchestrator.recover_interrupted_runs().await?;
    println!(
        "{} Recovery: {} detected, {} recovered, {} failed",
        INFO,
        report.detected,
        style(report.recovered).green(),
        style(report.failed).red()
    );
    for failure in &report.errors {
        println!(
            "  {} {}: {}",
            CROSS,
            style(&failure.run_id.to_string()[..8]).dim(),
            failure.error
        );
    }

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_worker(store: Arc<dyn PipelineStore>, registry: Arc<PipelineRegistry>) -> Result<()> {
    let config = WorkerConfig::from_env()?;
    let worker = Worker::new(store, registry, config);
    worker.run().await
}

/// Built-in pipelines registered at startup so `list` and `run` work out
/// of the box.
fn demo_pipelines() -> Vec<PipelineDefinition> {
    let report = PipelineDefinition::new("demo-report")
        .description("Fetch, summarize and publish a small report")
        .step(StepDefinition::new("fetch", |_ctx| async {
            StepResult::ok_with(json!([12, 7, 23]))
        }))
        .step(StepDefinition::new("summarize", |ctx| async move {
            let total: i64 = ctx
                .prev_data("fetch")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_i64())
                .sum();
            StepResult::ok_with(json!({ "total": total }))
        }))
        .step(StepDefinition::new("publish", |ctx| async move {
            match ctx.prev_data("summarize") {
                Some(summary) => StepResult::ok_with(json!({ "published": summary })),
                None => StepResult::err("nothing to publish"),
            }
        }));

    let fanout = PipelineDefinition::new("demo-fanout")
        .description("Diamond-shaped pipeline exercising parallel branches")
        .step(StepDefinition::new("extract", |_ctx| async {
            StepResult::ok_with(json!({ "records": 100 }))
        }))
        .step(
            StepDefinition::new("clean", |_ctx| async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                StepResult::ok_with(json!({ "cleaned": true }))
            })
            .depends_on(["extract"])
            .timeout(std::time::Duration::from_secs(30)),
        )
        .step(
            StepDefinition::new("enrich", |_ctx| async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                StepResult::ok_with(json!({ "enriched": true }))
            })
            .depends_on(["extract"])
            .timeout(std::time::Duration::from_secs(30)),
        )
        .step(
            StepDefinition::new("merge", |ctx| async move {
                if ctx.prev_data("clean").is_some() && ctx.prev_data("enrich").is_some() {
                    StepResult::ok_with(json!({ "merged": true }))
                } else {
                    StepResult::err("branch output missing")
                }
            })
            .depends_on(["clean", "enrich"]),
        );

    vec![report, fanout]
}
