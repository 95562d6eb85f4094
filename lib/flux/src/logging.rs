//! Thin facade over `slog` so components only ever name `logging::*`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a terminal logger writing to stderr at the given severity.
pub fn terminal(severity: Severity) -> Logger {
    TerminalLoggerBuilder::new()
        .level(severity)
        .destination(Destination::Stderr)
        .build()
        .expect("Failed to construct terminal logger")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
