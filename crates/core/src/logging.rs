//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{Error, Result};

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,frameflight=debug,frameflight_rhi=debug,frameflight_renderer=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Target and thread id annotations, useful when a submission thread
///   and a recording thread log side by side
///
/// # Panics
///
/// Panics if a global subscriber has already been installed. Use
/// [`try_init_logging`] where that can happen (tests, embedding).
///
/// # Example
/// ```no_run
/// frameflight_core::init_logging();
/// tracing::info!("Render device starting");
/// ```
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Like [`init_logging`], but reports an already-installed subscriber as an error.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already set.
pub fn try_init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_reported() {
        // The first call may fail if another test installed a subscriber; the
        // second one must fail either way.
        let _ = try_init_logging();
        assert!(matches!(try_init_logging(), Err(Error::Internal(_))));
    }
}
