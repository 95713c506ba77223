//! Structured logging system for the state broker
//!
//! This module provides a small, ergonomic logging API with:
//! - Standard log levels (Error/Warning/Info/Debug/Verbose)
//! - Per-module debug control via --debug-<module> flags
//! - Colored console output with aligned tag and level columns
//!
//! ## Usage
//!
//! ```rust
//! use statebroker::logger::{self, LogTag};
//!
//! logger::error(LogTag::Transport, "Socket write failed");
//! logger::warning(LogTag::Broker, "Outbound queue full");
//! logger::info(LogTag::System, "Broker started");
//! logger::debug(LogTag::Liveness, "Ping sent"); // Only if --debug-liveness
//! logger::verbose(LogTag::Topics, "Raw body: ..."); // Only if --verbose
//! ```
//!
//! ## Initialization
//!
//! Call `logger::init()` once at startup, before the broker is spawned.

mod config;
mod core;
mod format;
mod levels;
mod tags;

pub use config::{get_logger_config, init_from_args, set_logger_config, LoggerConfig};
pub use levels::LogLevel;
pub use tags::LogTag;

/// Initialize the logger system from command-line arguments
///
/// Scans the process arguments for --debug-<module>, --verbose and --quiet
/// and installs the resulting configuration.
pub fn init() {
    config::init_from_args();
}

/// Log at ERROR level (always shown, critical issues)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level (important issues)
///
/// Warnings are shown by default (unless --quiet raises the threshold).
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level (detailed diagnostics)
///
/// Debug logs are ONLY shown when the --debug-<module> flag matching the tag
/// is provided, e.g. `--debug-broker` for `LogTag::Broker`.
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level (very detailed tracing)
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}
