//! Tracing subscriber setup.
//!
//! The filter comes from `ENSAYO_LOG` when it holds a valid directive,
//! otherwise from the configured [`Verbosity`].

use crate::config::Verbosity;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter
pub const LOG_ENV_VAR: &str = "ENSAYO_LOG";

/// Output format of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Build the filter for `verbosity`, honouring `ENSAYO_LOG`
#[must_use]
pub fn env_filter(verbosity: Verbosity) -> EnvFilter {
    std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(verbosity.filter_directive()))
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(verbosity: Verbosity, format: LogFormat) -> bool {
    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer().with_target(false)), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(text)
        .with(json)
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness's capture
pub fn init_test_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(env_filter(Verbosity::Verbose))
        .try_init()
        .is_ok()
}
