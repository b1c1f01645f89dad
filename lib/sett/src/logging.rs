//! Logging bootstrap. Components receive their own `Logger` built from the
//! per-sink and per-component thresholds carried in configuration; call sites
//! use the re-exported slog macros.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::PathBuf;
use thiserror::Error;

/// Log file rotation threshold.
const ROTATE_SIZE: u64 = 8 * 1024 * 1024;
const ROTATE_KEEP: usize = 2;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("logging setup failed: {0}")]
    Build(String),
}

/// Sink-level settings shared by every component logger.
#[derive(Clone)]
pub struct LogConf {
    pub console_level: u8,
    pub file_level: u8,
    pub path: Option<PathBuf>,
    pub quiet: bool,
}

/// Maps a numeric threshold (0..=3) onto a slog severity.
#[inline]
pub fn severity(level: u8) -> Severity {
    match level {
        0 => Severity::Error,
        1 => Severity::Info,
        2 => Severity::Debug,
        _ => Severity::Trace,
    }
}

/// A logger that swallows everything.
#[inline]
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// Builds the logger for one component. The effective threshold is the more
/// restrictive of the sink level and the component level. A configured log
/// path selects the rotating file sink, otherwise the console; `quiet`
/// silences the console sink entirely.
pub fn worker_logger(conf: &LogConf, name: &'static str, component_level: u8) -> Result<Logger, LogError> {
    if let Some(path) = &conf.path {
        let level = conf.file_level.min(component_level);

        let logger = FileLoggerBuilder::new(path.join(format!("{}.log", name)))
            .level(severity(level))
            .rotate_size(ROTATE_SIZE)
            .rotate_keep(ROTATE_KEEP)
            .build()
            .map_err(|err| LogError::Build(err.to_string()))?;

        return Ok(logger.new(o!("component" => name)));
    }

    if conf.quiet {
        return Ok(null_logger());
    }

    let level = conf.console_level.min(component_level);

    let logger = TerminalLoggerBuilder::new()
        .level(severity(level))
        .destination(Destination::Stderr)
        .build()
        .map_err(|err| LogError::Build(err.to_string()))?;

    Ok(logger.new(o!("component" => name)))
}
