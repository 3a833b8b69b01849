//! Logging and tracing setup.
//!
//! Every wait emits structured `tracing` events: pending observations and
//! streak resets at `debug`, convergence at `info`, timeouts and
//! cancellations at `warn`, fatal probe errors at `error`. All output goes to
//! **stderr**, since a provider's stdout is reserved for the host handshake.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `hemmer_reconciler=debug`)
//!
//! ```bash
//! # Watch every poll of every wait
//! RUST_LOG=hemmer_reconciler=debug ./my-provider
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn filter_or(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn install(filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
}

/// Initialize the default logging subscriber.
///
/// Respects `RUST_LOG`, falling back to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_FILTER);
}

/// Initialize logging with a custom fallback filter.
///
/// `default_level` is any `EnvFilter` directive, e.g. `"debug"` or
/// `"warn,hemmer_reconciler=debug"`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    if let Err(e) = install(filter_or(default_level)) {
        panic!("failed to install tracing subscriber: {}", e);
    }
}

/// Try to initialize logging, returning false if already initialized.
///
/// Handy in tests, where several cases may race to install a subscriber.
pub fn try_init_logging() -> bool {
    install(filter_or(DEFAULT_FILTER)).is_ok()
}
