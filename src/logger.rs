//! Process-wide tracing subscriber for devprobe.
//!
//! `main` resolves one effective level (CLI `-v` flags, then
//! `DEVPROBE_LOG_LEVEL`, then `log_level` in config) and calls [`init`]
//! exactly once. Listener, bootstrap and sink events all go through the
//! same subscriber, to stderr or to `log_file` when one is configured.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Install the subscriber.
///
/// `level` is a plain level or any `EnvFilter` directive such as
/// `devprobe=debug,hyper=warn`. With `from_cli` set the explicit level wins
/// over `RUST_LOG`; otherwise `RUST_LOG`, when set and valid, wins.
pub fn init(level: &str, from_cli: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let filter = build_filter(level, from_cli)?;
    let writer = match log_file {
        Some(path) => append_to(path)?,
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| AppError::Logger(format!("subscriber already installed: {e}")))
}

fn build_filter(level: &str, from_cli: bool) -> Result<EnvFilter, AppError> {
    let explicit = EnvFilter::try_new(level).map_err(|e| e.to_string());
    let from_env = EnvFilter::try_from_default_env().map_err(|e| e.to_string());

    let chosen = if from_cli { explicit.or(from_env) } else { from_env.or(explicit) };
    chosen.map_err(|e| AppError::Logger(format!("no usable log filter from '{level}' or RUST_LOG: {e}")))
}

fn append_to(path: &Path) -> Result<BoxMakeWriter, AppError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::Logger(format!("cannot open log file {}: {e}", path.display())))?;
    Ok(BoxMakeWriter::new(std::sync::Mutex::new(file)))
}

/// Reject a configured level tracing cannot parse. Runs before [`init`] so
/// a typo in config fails startup loudly.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    // tracing reads "" as ERROR; treat it as a typo instead.
    if level.trim().is_empty() {
        return Err(AppError::Logger("log level is empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("'{level}' is not a log level (error|warn|info|debug|trace|off)")))
}
