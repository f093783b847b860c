//! Log subscriber set-up.
//!
//! Lifecycle transitions are emitted as `tracing` events carrying a stable
//! `event` field (`guard_diverted`, `render_success`, `stream_closed`, ...)
//! plus the request id, so any subscriber can consume them.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::error::ServeError;
use crate::serve::config::ServerConfig;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `config.log_filter`. Installing twice is an error.
pub fn init(config: &ServerConfig) -> Result<(), ServeError> {
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(&config.log_filter))
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ServeError::Logging(e.to_string()))
}

fn build_env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
