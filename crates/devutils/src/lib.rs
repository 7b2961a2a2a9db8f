//! Shared helpers for the demos.

use tracing::{event, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global log subscriber, filtered by `RUST_LOG` or `info` if not set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .finish();

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        event!(Level::WARN, ?error, "log subscriber already installed");
    }
}
