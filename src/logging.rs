//! Tracing setup for the dispatch framework.
//!
//! Mirrors the teacher's `logging.rs` shape (a `Logger` handle that owns
//! the `tracing-appender` worker guards so file logging survives for the
//! process lifetime) but trimmed to what a library needs: one rolling file
//! appender plus an optional stdout layer, both gated by `EnvFilter`.

use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Owns the background worker thread(s) that flush log lines to disk.
/// Dropping this tears down logging, so callers keep it alive for as long
/// as they want logs (typically: bind it to a variable in `main`).
pub struct Logger {
    _guards: Vec<WorkerGuard>,
}

impl Logger {
    /// Initialize file logging under `log_dir` plus an stdout layer, both
    /// filtered by `RUST_LOG` (default `info`).
    pub fn init<P: AsRef<Path>>(log_dir: P) -> io::Result<Self> {
        let log_dir: PathBuf = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;

        let file_appender = RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            &log_dir,
            "ao-dispatch.log",
        );
        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(io::stdout());

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .json();

        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stdout_layer)
            .try_init()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Logger {
            _guards: vec![file_guard, stdout_guard],
        })
    }
}
