//! animedub - Automated anime dubbing
//!
//! Entry point: parses the command line, loads configuration, installs
//! logging and dispatches to the workflow.

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use animedub::cli::{Args, Commands};
use animedub::config::Config;
use animedub::ledger::StageStatus;
use animedub::scheduler::{ProgressUpdate, RunSummary};
use animedub::subtitle::format_timestamp;
use animedub::workflow::Workflow;

const DEFAULT_CONFIG_FILE: &str = "animedub.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { output, force } = &args.command {
        return init_config(output, *force);
    }

    let config = load_config(args.config.as_deref())?;
    setup_logging(args.verbose, &config.log_dir())?;
    info!("Starting animedub");

    match args.command {
        Commands::Dub { input, series, output } => {
            let (workflow, progress) = runnable_workflow(config).await?;
            let summary = workflow.dub_file(&input, series.as_deref(), output.as_deref()).await;
            finish_run(summary?, progress)?;
        }
        Commands::Batch { input_dir, series } => {
            let (workflow, progress) = runnable_workflow(config).await?;
            let summary = workflow.dub_directory(input_dir.as_deref(), series.as_deref()).await;
            finish_run(summary?, progress)?;
        }
        Commands::Resume => {
            let (workflow, progress) = runnable_workflow(config).await?;
            let summary = workflow.resume().await;
            finish_run(summary?, progress)?;
        }
        Commands::Retry { episode } => {
            let (workflow, progress) = runnable_workflow(config).await?;
            let summary = workflow.retry(&episode).await;
            finish_run(summary?, progress)?;
        }
        Commands::Status => {
            let workflow = Workflow::new(config)?;
            let statuses = workflow.status()?;
            if statuses.is_empty() {
                println!("No episodes in the ledger.");
                return Ok(());
            }

            println!("{:<34} {:<20} {:<28} {}", "Episode", "Series", "State", "Input");
            println!("{}", "-".repeat(116));
            for status in &statuses {
                println!(
                    "{:<34} {:<20} {:<28} {}",
                    status.spec.episode_id,
                    status.spec.series_id,
                    status.summary,
                    status.spec.input_path.display()
                );
                if let Some(error) = status.last_error.as_ref().filter(|_| !status.complete) {
                    println!("{:<34} last error: {}", "", error);
                }
            }
        }
        Commands::Profiles { series } => {
            let workflow = Workflow::new(config)?;
            let profiles = workflow.profiles(&series).await?;
            if profiles.is_empty() {
                println!("No voice profiles for series '{}'.", series);
                return Ok(());
            }

            println!("\nVoice profiles for {}:", series);
            println!("{:<12} {:<10} {:<12} {:<22}", "Speaker", "Clips", "Embedding", "Last updated");
            println!("{}", "-".repeat(60));
            for profile in profiles {
                println!(
                    "{:<12} {:<10} {:<12} {:<22}",
                    profile.speaker_id,
                    profile.sample_count,
                    format!("{}x{}", profile.embedding.len(), profile.embedding_samples),
                    profile.last_updated.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Parse { input, language, lines } => {
            let workflow = Workflow::new(config)?;
            let result = workflow.parse_subtitles(&input, language.as_deref()).await?;
            println!("{}", result.summary());
            if lines {
                for line in &result.lines {
                    let speaker = line.speaker_hint.as_deref().unwrap_or("-");
                    println!(
                        "{:>5} {} -> {} [{}] {}",
                        line.index,
                        format_timestamp(line.start_ms),
                        format_timestamp(line.end_ms),
                        speaker,
                        line.text
                    );
                }
            }
        }
        Commands::InitConfig { .. } => unreachable!("handled before logging setup"),
    }

    Ok(())
}

/// `--config`, then ./animedub.toml, then built-in defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(config_path) => Config::from_file(config_path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::from_file(DEFAULT_CONFIG_FILE)?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    Config::default().save_to_file(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

/// Workflow with progress reporting and Ctrl-C cancellation wired up
async fn runnable_workflow(config: Config) -> Result<(Workflow, ProgressBar)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let workflow = Workflow::new(config)?.with_progress(tx);
    workflow.check_dependencies().await?;

    let cancel = workflow.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping episodes at the next safe point");
            cancel.cancel();
        }
    });

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.enable_steady_tick(Duration::from_millis(120));
    tokio::spawn(render_progress(rx, progress.clone()));

    Ok((workflow, progress))
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<ProgressUpdate>, progress: ProgressBar) {
    while let Some(update) = rx.recv().await {
        let message = format!(
            "{} {} {} (attempt {})",
            update.episode_id, update.stage, update.status, update.attempt
        );
        match update.status {
            StageStatus::Done | StageStatus::Failed => progress.println(message),
            _ => progress.set_message(message),
        }
    }
}

fn finish_run(summary: RunSummary, progress: ProgressBar) -> Result<()> {
    progress.finish_and_clear();

    println!(
        "\n{} completed, {} stuck, {} cancelled, {} errors",
        summary.completed.len(),
        summary.stuck.len(),
        summary.cancelled.len(),
        summary.errors.len()
    );
    for (episode_id, stage) in &summary.stuck {
        println!("  stuck: {} at {} (run `animedub retry {}` after fixing)", episode_id, stage, episode_id);
    }
    for episode_id in &summary.cancelled {
        println!("  cancelled: {} (run `animedub resume` to continue)", episode_id);
    }
    for (episode_id, error) in &summary.errors {
        println!("  error: {}: {}", episode_id, error);
    }

    if !summary.stuck.is_empty() || !summary.errors.is_empty() {
        anyhow::bail!("{} episode(s) did not complete", summary.stuck.len() + summary.errors.len());
    }
    Ok(())
}

fn setup_logging(verbose: bool, log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(log_dir, "animedub.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_file(verbose)
        .with_line_number(verbose);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("animedub.log").display()
    );

    Ok(())
}
