//! In-memory metrics backend.

use crate::histogram::MetricsBackend;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Append-only sample store shared between the application and watchers
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    samples: Arc<Mutex<BTreeMap<String, Vec<i64>>>>,
}

impl InMemoryMetrics {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<i64>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sample
    pub fn record(&self, name: impl Into<String>, value: i64) {
        self.lock().entry(name.into()).or_default().push(value);
    }

    /// Record a boolean sample (0 or 1)
    pub fn record_boolean(&self, name: impl Into<String>, value: bool) {
        self.record(name, i64::from(value));
    }

    /// Number of samples recorded for `name`
    #[must_use]
    pub fn total_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, Vec::len)
    }

    /// Names with at least one sample
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

impl MetricsBackend for InMemoryMetrics {
    fn samples(&self, name: &str) -> Vec<i64> {
        self.lock().get(name).cloned().unwrap_or_default()
    }
}
