//! Tracing setup for the shell.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: supervisor diagnostics via `RUST_LOG`, output to stderr.
//!   Backend stdout/stderr is re-emitted here under the `backend` target.
//!
//! - **Dialogs (`io/presenter`)**: user-facing fatal diagnostics. Always shown,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset: supervisor and backend lines at `info`,
/// dependencies at `warn`.
pub const DEFAULT_FILTER: &str = "signin_shell=info,backend=info,warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to [`DEFAULT_FILTER`] if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=signin_shell=debug signin-shell run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
