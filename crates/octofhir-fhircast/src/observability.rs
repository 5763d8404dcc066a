//! Tracing bootstrap for applications embedding a FHIRcast client.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `logging.level`. Only the first call has an effect.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let (filter, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Swap the level filter at runtime, e.g. after a config reload.
/// Returns `false` when [`init_tracing`] has not run.
pub fn apply_logging_level(level: &str) -> bool {
    FILTER_HANDLE
        .get()
        .is_some_and(|handle| handle.reload(EnvFilter::new(level)).is_ok())
}
