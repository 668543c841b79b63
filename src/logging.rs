//! Tracing subscriber set-up for the `rebootstrap` binary.
//!
//! Diagnostics go to stderr so `status` and `reset` keep stdout for JSON.
//! Command transcripts are written separately by
//! [`LoggingRunner`](crate::runner::LoggingRunner).

use std::io;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "rebootstrap=info,warn";

/// Filter used with `--verbose` when `RUST_LOG` is unset.
pub const VERBOSE_FILTER: &str = "rebootstrap=debug,info";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Raised when the filter directive cannot be parsed.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Raised when a global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Returns the filter directive for the requested verbosity.
#[must_use]
pub const fn default_filter(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }
}

/// Builds the filter, preferring `RUST_LOG` over the built-in default.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when the default directive is invalid.
pub fn env_filter(verbose: bool) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(verbose)))
        .map_err(|err| LoggingError::Filter(err.to_string()))
}

/// Installs the global tracing subscriber.
///
/// Verbose mode adds targets and span close events with timings, which shows
/// how long each phase ran.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber has
/// already been installed.
pub fn init_tracing(verbose: bool) -> Result<(), LoggingError> {
    let filter = env_filter(verbose)?;
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbose)
        .with_span_events(if verbose {
            fmt::format::FmtSpan::CLOSE
        } else {
            fmt::format::FmtSpan::NONE
        })
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}
