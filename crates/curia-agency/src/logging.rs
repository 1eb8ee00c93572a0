//! Structured logging for CuriaDB.
//!
//! One entry point, driven by the node's [`LoggingConfig`]: the configured
//! level and output format are the baseline, and the `CURIA_LOG`
//! environment variable overrides the filter with the usual `tracing`
//! directive syntax (`CURIA_LOG=warn,curia_agency::store=debug`).

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable overriding the configured log filter.
pub const LOG_ENV_VAR: &str = "CURIA_LOG";

/// Installs the process-global subscriber for this node.
///
/// Safe to call more than once: if a subscriber is already installed (test
/// harnesses, embedding applications) the existing one is kept.
pub fn init(config: &LoggingConfig) {
    let installed = if config.json {
        fmt().with_env_filter(filter(&config.level)).json().try_init()
    } else {
        fmt().with_env_filter(filter(&config.level)).compact().try_init()
    };
    let _ = installed;
}

/// `CURIA_LOG` wins over the configured level.
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(default_level))
}
