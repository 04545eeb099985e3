//! Logging setup, grounded on the teacher's `tracing.rs`: an env-filtered
//! subscriber writing to stderr, level controlled by `RUST_LOG` with a
//! sensible default so `stdout` stays clean for the agent's own output.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
