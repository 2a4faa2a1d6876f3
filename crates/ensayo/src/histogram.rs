//! Histogram Watchers
//!
//! Arm expectations on metric emissions before an action and verify them
//! afterwards, exactly once.
//!
//! A watcher moves through `Unarmed -> Armed -> PendingVerification ->
//! Consumed`. Arming snapshots how many samples each watched metric already
//! holds; verification only looks at samples recorded after that point.
//! Backends must be append-only for the snapshot to stay meaningful.

use crate::poll::{CheckResult, ConditionPoller};
use crate::result::{EnsayoError, EnsayoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read-only view of recorded metric samples
pub trait MetricsBackend: Send + Sync {
    /// All samples recorded for `name`, oldest first
    fn samples(&self, name: &str) -> Vec<i64>;
}

impl std::fmt::Debug for dyn MetricsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn MetricsBackend")
    }
}

impl<T: MetricsBackend + ?Sized> MetricsBackend for Arc<T> {
    fn samples(&self, name: &str) -> Vec<i64> {
        (**self).samples(name)
    }
}

/// Lifecycle state of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherState {
    /// Built but not yet snapshotting
    Unarmed,
    /// Snapshot taken, no watched samples since
    Armed,
    /// Watched samples recorded since arming
    PendingVerification,
    /// Verified; cannot be used again
    Consumed,
}

/// Expectations for one metric name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricExpectation {
    /// Expected count per exact value
    pub values: BTreeMap<i64, usize>,
    /// Records of any value
    pub any: usize,
    /// Explicitly expect nothing
    pub none: bool,
    /// Accept more records than expected
    pub allow_extra: bool,
}

impl MetricExpectation {
    /// Number of records expected in total
    #[must_use]
    pub fn expected_total(&self) -> usize {
        self.values.values().sum::<usize>() + self.any
    }

    fn check(&self, name: &str, observed: &[i64]) -> Result<(), EnsayoError> {
        let total_ok = if self.allow_extra {
            observed.len() >= self.expected_total()
        } else {
            observed.len() == self.expected_total()
        };
        let values_ok = self
            .values
            .iter()
            .all(|(value, count)| observed.iter().filter(|s| *s == value).count() >= *count);
        if total_ok && values_ok {
            return Ok(());
        }
        Err(EnsayoError::AssertionMismatch {
            expected: format!("{name}: {self}"),
            actual: format!("{} record(s) {:?}", observed.len(), observed),
            captured: observed.iter().map(|s| format!("{name} = {s}")).collect(),
        })
    }
}

impl std::fmt::Display for MetricExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.none || self.expected_total() == 0 {
            write!(f, "no records")?;
        } else {
            let mut parts: Vec<String> = self
                .values
                .iter()
                .map(|(value, count)| format!("{count}x {value}"))
                .collect();
            if self.any > 0 {
                parts.push(format!("{}x any value", self.any));
            }
            write!(f, "{} (total {})", parts.join(", "), self.expected_total())?;
        }
        if self.allow_extra {
            write!(f, ", extra records allowed")?;
        }
        Ok(())
    }
}

/// Builder for [`HistogramWatcher`]
#[derive(Debug, Clone, Default)]
pub struct HistogramWatcherBuilder {
    expectations: BTreeMap<String, MetricExpectation>,
}

impl HistogramWatcherBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, name: impl Into<String>) -> &mut MetricExpectation {
        self.expectations.entry(name.into()).or_default()
    }

    /// Expect one record of `value`
    #[must_use]
    pub fn expect_int_record(self, name: impl Into<String>, value: i64) -> Self {
        self.expect_int_record_times(name, value, 1)
    }

    /// Expect one record of each value
    #[must_use]
    pub fn expect_int_records(mut self, name: impl Into<String>, values: &[i64]) -> Self {
        let entry = self.entry(name);
        for value in values {
            *entry.values.entry(*value).or_default() += 1;
        }
        self
    }

    /// Expect `times` records of `value`
    #[must_use]
    pub fn expect_int_record_times(
        mut self,
        name: impl Into<String>,
        value: i64,
        times: usize,
    ) -> Self {
        *self.entry(name).values.entry(value).or_default() += times;
        self
    }

    /// Expect one boolean record
    #[must_use]
    pub fn expect_boolean_record(self, name: impl Into<String>, value: bool) -> Self {
        self.expect_int_record(name, i64::from(value))
    }

    /// Expect no records at all
    #[must_use]
    pub fn expect_no_records(mut self, name: impl Into<String>) -> Self {
        self.entry(name).none = true;
        self
    }

    /// Expect one record of any value
    #[must_use]
    pub fn expect_any_record(self, name: impl Into<String>) -> Self {
        self.expect_any_record_times(name, 1)
    }

    /// Expect `times` records of any value
    #[must_use]
    pub fn expect_any_record_times(mut self, name: impl Into<String>, times: usize) -> Self {
        self.entry(name).any += times;
        self
    }

    /// Accept more records than expected for `name`
    #[must_use]
    pub fn allow_extra_records(mut self, name: impl Into<String>) -> Self {
        self.entry(name).allow_extra = true;
        self
    }

    fn validate(&self) -> EnsayoResult<()> {
        if self.expectations.is_empty() {
            return Err(EnsayoError::usage("histogram watcher has no expectations"));
        }
        for (name, expectation) in &self.expectations {
            if expectation.none && expectation.expected_total() > 0 {
                return Err(EnsayoError::usage(format!(
                    "{name}: expect_no_records combined with record expectations"
                )));
            }
            if expectation.none && expectation.allow_extra {
                return Err(EnsayoError::usage(format!(
                    "{name}: expect_no_records combined with allow_extra_records"
                )));
            }
        }
        Ok(())
    }

    /// Build and arm the watcher
    ///
    /// # Errors
    ///
    /// `Usage` if the expectations contradict each other.
    pub fn build(self, backend: impl MetricsBackend + 'static) -> EnsayoResult<HistogramWatcher> {
        let mut watcher = self.build_unarmed(backend)?;
        watcher.arm()?;
        Ok(watcher)
    }

    /// Build without arming
    ///
    /// # Errors
    ///
    /// `Usage` if the expectations contradict each other.
    pub fn build_unarmed(
        self,
        backend: impl MetricsBackend + 'static,
    ) -> EnsayoResult<HistogramWatcher> {
        self.validate()?;
        Ok(HistogramWatcher {
            verifier: Verifier {
                backend: Arc::new(backend),
                expectations: Arc::new(self.expectations),
                baseline: Arc::new(BTreeMap::new()),
            },
            state: WatcherState::Unarmed,
        })
    }
}

/// Evaluates expectations against the samples recorded since arming
#[derive(Clone)]
struct Verifier {
    backend: Arc<dyn MetricsBackend>,
    expectations: Arc<BTreeMap<String, MetricExpectation>>,
    baseline: Arc<BTreeMap<String, usize>>,
}

impl Verifier {
    fn delta(&self, name: &str) -> Vec<i64> {
        let skip = self.baseline.get(name).copied().unwrap_or(0);
        self.backend.samples(name).into_iter().skip(skip).collect()
    }

    fn verify(&self) -> EnsayoResult<()> {
        for (name, expectation) in self.expectations.iter() {
            expectation.check(name, &self.delta(name))?;
        }
        Ok(())
    }

    fn check(&self) -> CheckResult {
        self.verify().map_err(|e| e.to_string())
    }

    fn any_recorded(&self) -> bool {
        self.expectations
            .keys()
            .any(|name| !self.delta(name).is_empty())
    }
}

/// Watches metric emissions between arming and verification
pub struct HistogramWatcher {
    verifier: Verifier,
    state: WatcherState,
}

impl std::fmt::Debug for HistogramWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramWatcher")
            .field("state", &self.state)
            .field("expectations", &self.verifier.expectations)
            .field("baseline", &self.verifier.baseline)
            .finish_non_exhaustive()
    }
}

impl HistogramWatcher {
    /// Start building a watcher
    #[must_use]
    pub fn builder() -> HistogramWatcherBuilder {
        HistogramWatcherBuilder::new()
    }

    /// Armed watcher expecting exactly one record of `value`
    pub fn single_record(
        name: impl Into<String>,
        value: i64,
        backend: impl MetricsBackend + 'static,
    ) -> EnsayoResult<Self> {
        Self::builder().expect_int_record(name, value).build(backend)
    }

    /// Armed watcher expecting no records
    pub fn no_records(
        name: impl Into<String>,
        backend: impl MetricsBackend + 'static,
    ) -> EnsayoResult<Self> {
        Self::builder().expect_no_records(name).build(backend)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> WatcherState {
        match self.state {
            WatcherState::Armed if self.verifier.any_recorded() => {
                WatcherState::PendingVerification
            }
            state => state,
        }
    }

    /// Expectations per metric name
    #[must_use]
    pub fn expectations(&self) -> &BTreeMap<String, MetricExpectation> {
        &self.verifier.expectations
    }

    /// Snapshot current sample counts; later verification only sees newer samples
    ///
    /// # Errors
    ///
    /// `Usage` unless the watcher is unarmed.
    pub fn arm(&mut self) -> EnsayoResult<()> {
        if self.state != WatcherState::Unarmed {
            return Err(EnsayoError::usage(format!(
                "cannot arm a watcher in state {:?}",
                self.state
            )));
        }
        let baseline: BTreeMap<String, usize> = self
            .verifier
            .expectations
            .keys()
            .map(|name| (name.clone(), self.verifier.backend.samples(name).len()))
            .collect();
        debug!(metrics = ?baseline, "histogram watcher armed");
        self.verifier.baseline = Arc::new(baseline);
        self.state = WatcherState::Armed;
        Ok(())
    }

    /// Samples recorded for `name` since arming
    #[must_use]
    pub fn recorded_since_arming(&self, name: &str) -> Vec<i64> {
        self.verifier.delta(name)
    }

    fn ensure_verifiable(&self) -> EnsayoResult<()> {
        match self.state {
            WatcherState::Unarmed => Err(EnsayoError::usage("histogram watcher was never armed")),
            WatcherState::Consumed => {
                Err(EnsayoError::usage("histogram watcher already verified"))
            }
            WatcherState::Armed | WatcherState::PendingVerification => Ok(()),
        }
    }

    /// Verify all expectations and consume the watcher
    ///
    /// # Errors
    ///
    /// `Usage` if unarmed or already consumed, `AssertionMismatch` listing
    /// the observed samples of the first failing metric.
    pub fn assert_expected(&mut self) -> EnsayoResult<()> {
        self.ensure_verifiable()?;
        self.state = WatcherState::Consumed;
        let result = self.verifier.verify();
        match &result {
            Ok(()) => info!(metrics = self.verifier.expectations.len(), "histogram expectations met"),
            Err(e) => warn!(error = %e, "histogram expectations not met"),
        }
        result
    }

    /// Poll until the expectations hold, then consume the watcher
    ///
    /// # Errors
    ///
    /// `Usage` as for [`assert_expected`](Self::assert_expected); `Timeout`
    /// carrying the last mismatch; `Cancelled`.
    pub fn poll_until_satisfied(&mut self, poller: &ConditionPoller) -> EnsayoResult<()> {
        self.ensure_verifiable()?;
        self.state = WatcherState::Consumed;
        let verifier = self.verifier.clone();
        poller.poll(move || verifier.check()).map(|_| ())
    }
}

impl Drop for HistogramWatcher {
    fn drop(&mut self) {
        if matches!(
            self.state,
            WatcherState::Armed | WatcherState::PendingVerification
        ) {
            debug!("histogram watcher dropped without verification");
        }
    }
}
