//! Structured logging setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "dodo_scheduler=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `dodo_scheduler=info`. Does nothing when a global subscriber already exists,
/// so embedding applications keep their own.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
