//! Logging setup for hosts embedding the orchestrator

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,interaction_orchestrator=debug,sqlx=warn,hyper=warn";

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a human-readable subscriber
///
/// `RUST_LOG` overrides `default_filter`. Returns false when a global
/// subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .is_ok()
}

/// Install a subscriber emitting one JSON object per event
pub fn init_json_logging(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_logging(DEFAULT_FILTER);
        assert!(!init_logging(DEFAULT_FILTER));
        assert!(!init_json_logging(DEFAULT_FILTER));
    }
}
