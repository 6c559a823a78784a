//! Tracing subscriber setup.
//!
//! Log lines go to stderr so that stdout carries only command output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::RollsyncError;

/// Level used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_LEVEL: &str = "warn";

/// Install the global subscriber.
///
/// An explicit `level` wins over `RUST_LOG`.
///
/// # Errors
///
/// Returns `RollsyncError::Config` if the filter does not parse or a
/// subscriber is already installed.
pub fn init(level: Option<&str>) -> Result<(), RollsyncError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| RollsyncError::Config(format!("Invalid log level '{level}': {e}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL)),
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RollsyncError::Config(format!("Failed to initialize logging: {e}")))
}
