//! Tracing setup: a `fmt` subscriber behind a reloadable level filter.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

fn rust_log_set() -> bool {
    std::env::var_os(EnvFilter::DEFAULT_ENV).is_some()
}

/// `RUST_LOG` when it is set and parses, otherwise `level`.
fn initial_filter(level: &str) -> EnvFilter {
    if rust_log_set()
        && let Ok(filter) = EnvFilter::try_from_default_env()
    {
        return filter;
    }
    EnvFilter::new(level)
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the global subscriber once; later calls are ignored.
pub fn init_tracing_with_level(level: &str) {
    let (filter, handle) = reload::Layer::new(initial_filter(level));
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok()
    {
        let _ = FILTER.set(handle);
    }
}

/// Switches to the configured `logging.level` unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if rust_log_set() {
        return;
    }
    if let Some(handle) = FILTER.get()
        && let Err(e) = handle.reload(EnvFilter::new(level))
    {
        tracing::warn!(level, error = %e, "failed to apply logging level");
    }
}
