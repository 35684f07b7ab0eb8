//! # Trigger Metrics Configuration Validator
//!
//! Loads the layered configuration for an environment, validates it and prints
//! it with credentials redacted. `ping` additionally connects to the configured
//! store and prints a health report.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;
use trigger_metrics::config::{ConfigLoader, TriggerMetricsConfig};
use trigger_metrics::{build_store, HealthMonitor, HealthStatus};

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate trigger-metrics configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long)]
    environment: Option<String>,

    /// Configuration directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Ignore TRIGGER_METRICS_* environment overrides
    #[arg(long)]
    no_env: bool,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and print the effective configuration
    Validate,

    /// Validate, then connect to the store and print a health report
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match cli.command {
        Some(Commands::Ping) => ping(&cli).await,
        Some(Commands::Validate) | None => validate(&cli).map(|_| ()),
    };

    if let Err(e) = result {
        error!(error = %e, "Configuration check failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn load(cli: &Cli) -> Result<TriggerMetricsConfig> {
    let mut loader = ConfigLoader::new(&cli.config_dir);
    if let Some(environment) = &cli.environment {
        loader = loader.with_environment(environment);
    }
    if cli.no_env {
        loader = loader.without_env_overrides();
    }

    println!("Environment: {}", loader.environment());
    println!("Base file: {}", loader.base_file().display());
    println!("Environment file: {}", loader.environment_file().display());

    loader
        .load()
        .with_context(|| format!("loading configuration from {}", cli.config_dir))
}

fn validate(cli: &Cli) -> Result<TriggerMetricsConfig> {
    let config = load(cli)?;
    println!();
    println!("{}", serde_json::to_string_pretty(&config.sanitized())?);
    println!();
    println!("Configuration is valid");
    Ok(config)
}

async fn ping(cli: &Cli) -> Result<()> {
    let config = validate(cli)?;
    let store = build_store(&config.store).context("building event store")?;

    let connect = tokio::time::timeout(config.store.connect_timeout(), store.connect()).await;
    match connect {
        Ok(Ok(())) => {}
        Ok(Err(e)) => println!("Store connection failed: {e}"),
        Err(_) => println!(
            "Store connection timed out after {}ms",
            config.store.connect_timeout_ms
        ),
    }

    let monitor = HealthMonitor::new(Arc::clone(&store), config.health.clone());
    let report = monitor.check().await;
    println!();
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = store.close().await {
        println!("Store close failed: {e}");
    }

    if report.status == HealthStatus::Unhealthy {
        anyhow::bail!("store {} is unhealthy", report.store.provider);
    }
    Ok(())
}
