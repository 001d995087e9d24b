//! Thin re-export surface over `slog` plus the logger builders used by hosts.

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

#[derive(Debug)]
pub enum LoggingError {
    Config(String),
    Build(String),
}

/// A logger that swallows everything. Components fall back to this when no
/// parent logger is supplied.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Terminal logger writing to stderr.
pub fn terminal(verbose: bool) -> Result<Logger, LoggingError> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity(verbose));
    builder.destination(Destination::Stderr);
    builder
        .build()
        .map_err(|err| LoggingError::Build(err.to_string()))
}

/// File logger appending to the supplied path.
pub fn file<P: AsRef<Path>>(path: P, verbose: bool) -> Result<Logger, LoggingError> {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(severity(verbose));
    builder
        .build()
        .map_err(|err| LoggingError::Build(err.to_string()))
}

/// Build a logger from a TOML snippet describing a `sloggers::LoggerConfig`.
pub fn from_toml(config: &str) -> Result<Logger, LoggingError> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig =
        serdeconv::from_toml_str(config).map_err(|err| LoggingError::Config(err.to_string()))?;

    config
        .build_logger()
        .map_err(|err| LoggingError::Build(err.to_string()))
}

#[inline]
fn severity(verbose: bool) -> Severity {
    match verbose {
        true => Severity::Debug,
        false => Severity::Info,
    }
}
