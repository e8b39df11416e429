//! Tracing bootstrap for the daemon.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,courier_daemon=debug,courier_runtime=debug";

/// Install the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `COURIER_LOG`
/// 3) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    filter_from_value(env::var("COURIER_LOG").ok()).unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn filter_from_value(value: Option<String>) -> Option<EnvFilter> {
    value
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_or_invalid_values_fall_through() {
        assert!(filter_from_value(None).is_none());
        assert!(filter_from_value(Some("   ".to_owned())).is_none());
        assert!(filter_from_value(Some("courier_runtime=loud".to_owned())).is_none());
    }

    #[test]
    fn valid_value_builds_a_filter() {
        let filter = filter_from_value(Some("warn,courier_runtime=trace".to_owned()))
            .expect("filter should parse");
        assert!(filter.to_string().contains("courier_runtime=trace"));
    }
}
