//! Tracing setup (`spec.md` §4.0 "added Logging"): a `tracing-subscriber`
//! registry with an `EnvFilter` and a JSON or pretty formatter selected by
//! `LoggingConfig`, following the teacher's `LoggerImpl`. Deliberately
//! separate from `AuditLog` (C2): this is for operators, the audit log is
//! the durable decision record.

use std::io;

use anyhow::Result;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Holds the non-blocking writer guard; dropping it flushes pending log
/// lines, so the caller must keep this alive for the process lifetime.
pub struct LoggerGuard {
    _guard: Option<WorkerGuard>,
}

/// Installs the global `tracing` subscriber. Must be called exactly once,
/// before any other component starts logging.
pub fn init(config: &LoggingConfig) -> Result<LoggerGuard> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let guard = if let Some(log_dir) = &config.log_dir {
        let file_appender = rolling::daily(log_dir, "opscore.log");
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        match config.format {
            LogFormat::Json => {
                let stdout_layer = tracing_subscriber::fmt::layer().json().with_writer(io::stdout).with_target(true);
                tracing_subscriber::registry().with(env_filter).with(file_layer).with(stdout_layer).init();
            }
            LogFormat::Pretty => {
                let stdout_layer = tracing_subscriber::fmt::layer().pretty().with_writer(io::stdout).with_target(true);
                tracing_subscriber::registry().with(env_filter).with(file_layer).with(stdout_layer).init();
            }
        }
        Some(guard)
    } else {
        match config.format {
            LogFormat::Json => {
                let stdout_layer = tracing_subscriber::fmt::layer().json().with_writer(io::stdout).with_target(true);
                tracing_subscriber::registry().with(env_filter).with(stdout_layer).init();
            }
            LogFormat::Pretty => {
                let stdout_layer = tracing_subscriber::fmt::layer().pretty().with_writer(io::stdout).with_target(true);
                tracing_subscriber::registry().with(env_filter).with(stdout_layer).init();
            }
        }
        None
    };

    tracing::info!(level = %config.level, format = ?config.format, file_output = config.log_dir.is_some(), "logger initialized");
    Ok(LoggerGuard { _guard: guard })
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("invalid log level: {level}"),
    }
}
