//! Tracing setup: a rolling log file plus a console layer in text mode

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Dependencies that are chatty at info: sqlx logs every statement, the
/// HTTP stacks log every connection.
const QUIET_DEPS: &[&str] = &["sqlx=warn", "hyper=warn", "reqwest=warn", "tower_http=warn"];

/// Filter used when `RUST_LOG` is unset: `level` for everything else,
/// warn for the noisy dependencies.
pub fn default_filter(level: &str) -> String {
    let level = match level.trim() {
        "" => "info",
        other => other,
    };
    std::iter::once(level)
        .chain(QUIET_DEPS.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber. JSON mode writes structured lines to the
/// file only; text mode also echoes to stdout with colors.
///
/// Keep the returned guard alive for the life of the process.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));

    let (json_file, text_file, console) = if config.use_json {
        let layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), None, None)
    } else {
        let layer = fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false);
        (None, Some(layer), Some(fmt::layer().with_target(false)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_file)
        .with(text_file)
        .with(console)
        .init();

    guard
}
