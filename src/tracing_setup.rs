//! Logging bootstrap.
//!
//! Two sinks: the console at whatever level the user asked for, and a
//! full-detail file under `logs/` that a bug report can ship without
//! asking the user to reproduce anything.

use std::io;
use std::path::Path;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File receiving the full-detail log of the current run.
const DEBUG_LOG_NAME: &str = "debug.log";

/// Installs the global subscriber: compact console output plus a
/// trace-level debug file.
///
/// `RUST_LOG` overrides the console level when set. The debug file is
/// truncated on every start, so it always describes the latest run.
///
/// # Errors
///
/// Fails when the logs directory or file cannot be created, or when a
/// global subscriber is already installed.
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> io::Result<()> {
    let dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    std::fs::create_dir_all(dir)?;
    let debug_path = dir.join(DEBUG_LOG_NAME);
    let debug_file = std::fs::File::create(&debug_path)?;

    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .from_env_lossy();
    let console = fmt::layer().compact().with_filter(console_filter);

    let file = fmt::layer()
        .with_ansi(false)
        .with_line_number(true)
        .with_writer(debug_file)
        .with_filter(LevelFilter::TRACE);

    tracing_subscriber::registry()
        .with(file)
        .with(console)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::debug!(path = %debug_path.display(), "debug log opened");
    Ok(())
}
