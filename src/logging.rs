//! Structured logging setup.

// ============================================================================
// LOGGING
// ============================================================================

use std::time::{Duration, Instant};

use tracing::{info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{ExporterError, ExporterResult};

fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber. `RUST_LOG` directives refine the configured level.
pub fn init_logging(settings: &LoggingSettings) -> ExporterResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&settings.level).into())
        .from_env_lossy();

    let installed = match settings.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true).with_thread_names(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(settings.ansi).with_target(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_ansi(settings.ansi).with_target(true).with_thread_names(true));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {e}")))?;

    info!(target: "exporter::init", level = %settings.level, format = ?settings.format, "Logging initialized");
    Ok(())
}

/// Wall-clock timer for passes and refreshes; warns when over its threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold: Option<Duration>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: None,
        }
    }

    /// Timer that warns on `stop` when `threshold` is exceeded
    pub fn with_threshold(name: &'static str, threshold: Duration) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::new(name)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        if let Some(threshold) = self.threshold.filter(|t| elapsed > *t) {
            warn!(
                target: "exporter::perf",
                operation = self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Operation exceeded threshold"
            );
        }
        trace!(target: "exporter::perf", operation = self.name, elapsed_ms = elapsed.as_millis() as u64, "Operation completed");
        elapsed
    }
}
