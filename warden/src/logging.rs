//! Tracing setup for the daemon and CLI commands.
//!
//! Everything goes to stderr so `status` and `worktrees` output on stdout
//! stays clean for scripts.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warden=info`, or `warden=debug` when
/// `verbose` is set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=warden::io::git=trace warden run --once
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warden=debug" } else { "warden=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
