//! Structured logging setup (A2): wires a `tracing_subscriber::fmt`
//! subscriber honoring `RUST_LOG`/the `global.yaml` log level, and
//! optionally a rolling file appender under the base directory for
//! non-interactive runs.

use std::path::Path;

use tracing_subscriber::{fmt, EnvFilter};

use crate::settings::{GlobalSettings, LogFormat};

/// Kept alive for the process lifetime to flush the background writer on
/// drop.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. `base_dir` is used for the rolling file
/// appender when `with_file_appender` is true.
pub fn init(
    settings: &GlobalSettings,
    base_dir: &Path,
    with_file_appender: bool,
) -> LoggingGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));

    let builder = fmt().with_env_filter(filter);

    if with_file_appender {
        let log_dir = base_dir.join("logs");
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "dev-stack.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match settings.log.format {
            LogFormat::Json => {
                builder.json().with_writer(non_blocking).init();
            }
            LogFormat::Pretty => {
                builder.with_writer(non_blocking).init();
            }
        }
        LoggingGuard {
            _file_guard: Some(guard),
        }
    } else {
        match settings.log.format {
            LogFormat::Json => {
                builder.json().init();
            }
            LogFormat::Pretty => {
                builder.init();
            }
        }
        LoggingGuard { _file_guard: None }
    }
}
