//! Logging setup using tracing
//!
//! Library code logs with structured fields (`source`, `target`, `event_id`,
//! `channel_id`, ...); this module installs the subscriber that renders them.

use crate::MirrorError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber
///
/// Filtering follows `RUST_LOG` (for example `RUST_LOG=calmirror=debug`), falling
/// back to `warn`, or `verbose` raises the crate to `info`. Output goes to stderr
/// so command output on stdout stays machine-readable.
///
/// # Errors
/// Returns an error if a subscriber was already installed
pub fn init(verbose: bool) -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(format!("{},calmirror=info", DEFAULT_FILTER))
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| MirrorError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init(false);
}
