//! Structured logging for Canopy nodes.
//!
//! `RUST_LOG` always wins. When it is unset the caller's default level
//! applies (`info` unless stated otherwise).

use crate::config::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize human-readable logging at `info`.
///
/// # Example
/// ```no_run
/// use canopy_core::logging;
///
/// logging::init();
/// tracing::info!("Node started");
/// ```
pub fn init() {
    init_with(LogFormat::Pretty, "info");
}

/// Initialize JSON logging at `info`, one object per event.
///
/// # Example
/// ```no_run
/// use canopy_core::logging;
///
/// logging::init_json();
/// tracing::info!(node_id = 42u32, "Node started");
/// ```
pub fn init_json() {
    init_with(LogFormat::Json, "info");
}

/// Initialize logging in `format`, falling back to `default_level` when
/// `RUST_LOG` is unset.
pub fn init_with(format: LogFormat, default_level: &str) {
    let filter = env_filter(default_level);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_builds() {
        // The global subscriber can only be installed once per process,
        // so only the filter construction is exercised here.
        let _ = env_filter("debug");
        let _ = env_filter("canopy_mesh=trace,info");
    }
}
