//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that integrates with systemd's journal when
//! the service runs under systemd, with a rolling file plus stderr fallback
//! for other platforms or when journald is disabled or unavailable.

use anyhow::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Initialize the logging system.
///
/// Log level can be controlled via the `SNAPCLASS_LOG` environment variable:
/// - `SNAPCLASS_LOG=debug` for verbose output
/// - `SNAPCLASS_LOG=info` for standard output (default)
/// - `SNAPCLASS_LOG=snapclass=debug,tower_http=info` for per-target filters
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("SNAPCLASS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if config.journald {
            if let Ok(journald_layer) = tracing_journald::layer() {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(journald_layer)
                    .try_init()?;

                tracing::info!("Logging initialized with journald backend");
                return Ok(());
            }
        }
    }

    std::fs::create_dir_all(&config.directory)?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, "snapclass.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard would stop the background writer; init() runs once at startup.
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    tracing::info!(directory = ?config.directory, "Logging initialized with file backend");
    Ok(())
}
