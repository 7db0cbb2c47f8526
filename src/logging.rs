//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that goes to the systemd journal on Linux,
//! with a daily-rolling file as the fallback, or to stderr on request.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "FOOTFALL_LOG";

/// Where log records are written
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// journald when available, otherwise a rolling file
    #[default]
    System,
    /// A rolling file in the given directory
    File(PathBuf),
    Stderr,
}

/// Initialize the logging system.
///
/// Log level can be controlled via the `FOOTFALL_LOG` environment variable,
/// e.g. `FOOTFALL_LOG=debug` or `FOOTFALL_LOG=footfall::pipeline=trace`.
/// Defaults to `info`.
pub fn init(target: LogTarget) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            return Ok(());
        }
        LogTarget::File(dir) => dir,
        LogTarget::System => {
            #[cfg(target_os = "linux")]
            {
                if let Ok(journald_layer) = tracing_journald::layer() {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(journald_layer)
                        .init();

                    tracing::info!("Logging initialized with journald backend");
                    return Ok(());
                }
            }
            default_log_dir()
        }
    };

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "footfall.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer flushes until the guard drops; keep it for the process lifetime
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(dir = ?log_dir, "Logging initialized with file backend");
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("footfall")
        .join("logs")
}
