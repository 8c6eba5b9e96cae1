//! Tracing subscriber setup shared by every process.

use std::env;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber for `service`.
///
/// `RUST_LOG` wins when set. Otherwise `LOG_LEVEL` (default `info`) applies to
/// the jobgate crates and `warn` to everything else. `LOG_FORMAT=json` switches
/// to one JSON object per line.
pub fn init(service: &str) {
    let level = env::var("LOG_LEVEL")
        .ok()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
        .to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,jobgate={level},jobgate_api={level},jobgate_bot={level},jobgate_cli={level},tower_http={level}"
        ))
    });

    let json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // A second init (tests, run-all children sharing code paths) is not an error.
    let result = if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };

    if result.is_ok() {
        tracing::debug!(service, "logging initialised");
    }
}
