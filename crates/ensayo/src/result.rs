//! Result and error types for Ensayo.

use thiserror::Error;

/// Result type for Ensayo operations
pub type EnsayoResult<T> = Result<T, EnsayoError>;

/// Errors that can occur in Ensayo
#[derive(Debug, Error)]
pub enum EnsayoError {
    /// Session acquisition or teardown conflict
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        /// Error message
        message: String,
    },

    /// Restoring a reused session to its baseline failed
    #[error("Reset of session {session} failed: {message}")]
    ResetFailure {
        /// Session that could not be restored
        session: u64,
        /// Error message
        message: String,
    },

    /// Observed outcome did not match the expectation
    #[error("Assertion mismatch: expected {expected}, actual {actual}{}", format_captured(.captured))]
    AssertionMismatch {
        /// What was expected
        expected: String,
        /// What was observed
        actual: String,
        /// Everything captured that is relevant to the diagnosis
        captured: Vec<String>,
    },

    /// API called in the wrong state (e.g. verifying a watcher twice)
    #[error("Usage error: {message}")]
    Usage {
        /// Error message
        message: String,
    },

    /// Condition was not satisfied before the deadline
    #[error("Timed out after {ms}ms: {last_seen}")]
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
        /// Last failure reported by the predicate
        last_seen: String,
    },

    /// Polling was cancelled by the enclosing test
    #[error("Polling cancelled after {after_ms}ms")]
    Cancelled {
        /// Elapsed time when cancellation was observed
        after_ms: u64,
    },

    /// The application under test reported a failure
    #[error("Application error: {message}")]
    App {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_captured(captured: &[String]) -> String {
    if captured.is_empty() {
        return String::new();
    }
    let mut out = String::from("\ncaptured:");
    for entry in captured {
        out.push_str("\n  - ");
        out.push_str(entry);
    }
    out
}

impl EnsayoError {
    /// Create a lifecycle error
    #[must_use]
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Create a usage error
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create an application error
    #[must_use]
    pub fn app(message: impl Into<String>) -> Self {
        Self::App {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the failure means the system under test never reached the
    /// expected state, as opposed to a harness malfunction.
    #[must_use]
    pub const fn is_outcome_failure(&self) -> bool {
        matches!(
            self,
            Self::AssertionMismatch { .. } | Self::Timeout { .. } | Self::App { .. }
        )
    }
}
