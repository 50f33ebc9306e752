//! Command-line entry point for the exporter.

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use multicloud_exporter::config::AccountStore;
use multicloud_exporter::logging::init_logging;
use multicloud_exporter::{EngineBuilder, ExporterConfig, ExporterError, ExporterResult, EXPORTER_FULL_NAME, EXPORTER_VERSION};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------

/// Multi-cloud metrics exporter
#[derive(Parser, Debug)]
#[command(
    name = "multicloud-exporter",
    author = "AIOps Team",
    version,
    about = "Multi-cloud monitoring exporter for Prometheus",
    long_about = "Discovers monitored products per cloud provider, collects their metrics \
                  with bounded fan-out across a sharded replica set, and exposes them as \
                  canonical Prometheus gauges."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "exporter.toml", env = "EXPORTER_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "EXPORTER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the exporter (default)
    Run,

    /// Validate configuration and account files
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match ExporterConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed: {e}");
            return Err(e.into());
        }
    };
    println!("Configuration is valid");

    if verbose {
        println!("\nParsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{s}"),
            Err(e) => println!("Failed to serialize: {e}"),
        }
    }

    println!("\nSummary:");
    println!("  listen address:      {}", config.server.listen_addr);
    println!("  collection interval: {}", humantime::format_duration(config.collection.interval));
    println!(
        "  fan-out:             regions {} / products {} / metrics {}",
        config.collection.region_concurrency, config.collection.product_concurrency, config.collection.metric_concurrency
    );
    println!("  batch size:          {}", config.collection.batch_size);

    match config.accounts.resolved_path() {
        Some(path) => {
            let store = AccountStore::from_file(&path)?;
            let accounts = store.snapshot();
            println!("  account file:        {} ({} accounts)", path.display(), accounts.len());
            for provider in accounts.providers() {
                println!("    - {provider}: {}", accounts.for_provider(&provider).count());
            }
        }
        None => println!("  account file:        none"),
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str).map_err(ExporterError::Io)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{EXPORTER_FULL_NAME} v{EXPORTER_VERSION}");
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS: {}", std::env::consts::OS);
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: "exporter::main", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "exporter::main", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "exporter::main", "Received SIGINT"),
        _ = terminate => info!(target: "exporter::main", "Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        ExporterConfig::load(&cli.config).with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ExporterConfig::from_env().context("Failed to load config from environment")?
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    init_logging(&config.logging)?;
    if !config_found {
        warn!(target: "exporter::main", path = %cli.config.display(), "Config file not found, using defaults");
    }

    let engine = EngineBuilder::new(config)?
        .build()
        .await
        .context("Failed to build exporter")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    engine.run(cancel).await?;
    Ok(())
}
