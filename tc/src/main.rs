//! tc - task claim coordination
//!
//! CLI entry point for fleet simulations and config inspection.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::info;

use taskcoord::cli::{Cli, Command};
use taskcoord::config::Config;
use taskcoord::simulate::{SimulationConfig, SimulationReport, simulate};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskcoord")
        .join("logs");

    // Write to a log file, not stdout; fall back to stderr if that is impossible
    let log_file = fs::create_dir_all(&log_dir).and_then(|_| fs::File::create(log_dir.join("taskcoord.log")));
    match log_file {
        Ok(file) => tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init(),
        Err(e) => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            tracing::warn!("Could not open log file in {}: {}", log_dir.display(), e);
        }
    }

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "taskcoord loaded config: namespace={}, claim-ttl-ms={}",
        config.coordinator.namespace, config.coordinator.claim_ttl_ms
    );

    match cli.command {
        Some(Command::Simulate {
            nodes,
            tasks,
            ttl_ms,
            work_ms,
            timeout_secs,
        }) => cmd_simulate(config, nodes, tasks, ttl_ms, work_ms, timeout_secs).await,
        Some(Command::Config) => cmd_config(&config),
        None => {
            println!("{}", "No command given; try `tc simulate` or `tc --help`".yellow());
            Ok(())
        }
    }
}

async fn cmd_simulate(
    mut config: Config,
    nodes: usize,
    tasks: usize,
    ttl_ms: Option<u64>,
    work_ms: u64,
    timeout_secs: u64,
) -> Result<()> {
    if let Some(ttl_ms) = ttl_ms {
        config.coordinator.claim_ttl_ms = ttl_ms;
        // Keep an explicit interval only while it still fits inside the new TTL
        if config.coordinator.renew_interval_ms.is_some_and(|ms| ms >= ttl_ms) {
            config.coordinator.renew_interval_ms = None;
        }
    }
    config.validate().context("Invalid simulation settings")?;

    let sim = SimulationConfig {
        timeout: Duration::from_secs(timeout_secs),
        ..SimulationConfig::from_config(&config, nodes, tasks, Duration::from_millis(work_ms))
    };

    println!(
        "{} {} nodes, {} tasks, claim TTL {} ms",
        "Simulating".bold(),
        nodes,
        tasks,
        config.coordinator.claim_ttl_ms
    );

    let report = simulate(&sim).await.context("Simulation failed")?;
    print_report(&report);

    if report.is_complete() {
        Ok(())
    } else {
        Err(eyre!(
            "only {} of {} tasks completed",
            report.completed_count(),
            report.total_tasks
        ))
    }
}

fn print_report(report: &SimulationReport) {
    println!();
    for (node_id, tasks) in &report.completed {
        println!("  {:<10} {:>4} tasks", node_id.cyan(), tasks.len());
    }
    println!();

    let summary = format!(
        "{}/{} tasks completed in {:.2}s, {} commands delivered",
        report.completed_count(),
        report.total_tasks,
        report.elapsed.as_secs_f64(),
        report.commands_delivered
    );
    if report.is_complete() {
        println!("{}", summary.green());
    } else {
        println!("{}", summary.red());
    }

    for (node_id, reason) in &report.shutdown_errors {
        println!("{} {}: {}", "shutdown".yellow(), node_id, reason);
    }
}

fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
