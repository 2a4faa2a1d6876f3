//! Test harness for running batches of test cases against sessions.
//!
//! Each case acquires a session under the suite's policy, runs its body
//! with panics caught, and releases the session before the next case
//! starts. Device restrictions turn into skips.

use crate::app::AppFactory;
use crate::config::{DeviceProfile, DeviceRestriction, HarnessConfig};
use crate::histogram::{HistogramWatcher, HistogramWatcherBuilder, MetricsBackend};
use crate::intent::IntentRecorder;
use crate::poll::{CancellationToken, ConditionPoller, ExecutionContext, PollOptions, UiThread};
use crate::result::{EnsayoError, EnsayoResult};
use crate::session::{SessionGuard, SessionManager, SessionPolicy};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Body of a test case
pub type TestBody = Arc<dyn Fn(&mut TestContext<'_>) -> EnsayoResult<()> + Send + Sync>;

/// What a test body can reach while it runs
pub struct TestContext<'a> {
    name: &'a str,
    session: SessionGuard<'a>,
    intents: &'a IntentRecorder,
    metrics: Option<Arc<dyn MetricsBackend>>,
    poller: ConditionPoller,
}

impl std::fmt::Debug for TestContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl<'a> TestContext<'a> {
    /// Name of the running test
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name
    }

    /// Session held by this test
    #[must_use]
    pub const fn session(&self) -> &SessionGuard<'a> {
        &self.session
    }

    /// Intent recorder wired into the application
    #[must_use]
    pub const fn intents(&self) -> &IntentRecorder {
        self.intents
    }

    /// Poller on the suite's execution context, cancelled if the test ends
    #[must_use]
    pub const fn poller(&self) -> &ConditionPoller {
        &self.poller
    }

    /// Metrics backend
    ///
    /// # Errors
    ///
    /// `Usage` if the harness has no metrics backend.
    pub fn metrics(&self) -> EnsayoResult<Arc<dyn MetricsBackend>> {
        self.metrics
            .clone()
            .ok_or_else(|| EnsayoError::usage("no metrics backend attached to the harness"))
    }

    /// Build and arm a histogram watcher on the harness's metrics backend
    pub fn watch(&self, builder: HistogramWatcherBuilder) -> EnsayoResult<HistogramWatcher> {
        builder.build(self.metrics()?)
    }
}

/// A single test case
#[derive(Clone)]
pub struct TestCase {
    /// Test name
    pub name: String,
    /// Device restrictions; the test is skipped unless all hold
    pub restrictions: Vec<DeviceRestriction>,
    /// Test body
    pub body: TestBody,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("restrictions", &self.restrictions)
            .finish_non_exhaustive()
    }
}

impl TestCase {
    /// Create a new test case
    #[must_use]
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> EnsayoResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            restrictions: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Add a restriction
    #[must_use]
    pub fn with_restriction(mut self, restriction: DeviceRestriction) -> Self {
        self.restrictions.push(restriction);
        self
    }
}

/// A test suite (one test class) sharing configuration
#[derive(Debug, Clone)]
pub struct TestSuite {
    /// Suite name
    pub name: String,
    /// Class-level configuration
    pub config: HarnessConfig,
    /// Tests in this suite
    pub tests: Vec<TestCase>,
}

impl TestSuite {
    /// Create a new test suite with default configuration
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HarnessConfig::default(),
            tests: Vec::new(),
        }
    }

    /// Set the configuration
    #[must_use]
    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a test case
    #[must_use]
    pub fn with_test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }

    /// Add a test case
    pub fn add_test(&mut self, test: TestCase) {
        self.tests.push(test);
    }

    /// Get the number of tests
    #[must_use]
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    /// Body returned `Ok`
    Passed,
    /// Body returned an error or panicked, or no session could be acquired
    Failed {
        /// Failure message
        message: String,
    },
    /// Not run
    Skipped {
        /// Why
        reason: String,
    },
}

/// Result of running a single test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Outcome
    pub outcome: TestOutcome,
    /// Test duration in milliseconds
    pub duration_ms: u64,
    /// Session warnings raised while releasing this test's session
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl TestResult {
    /// Create a passing test result
    #[must_use]
    pub fn pass(name: impl Into<String>) -> Self {
        Self::with_outcome(name, TestOutcome::Passed)
    }

    /// Create a failing test result
    #[must_use]
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_outcome(
            name,
            TestOutcome::Failed {
                message: message.into(),
            },
        )
    }

    /// Create a skipped test result
    #[must_use]
    pub fn skip(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_outcome(
            name,
            TestOutcome::Skipped {
                reason: reason.into(),
            },
        )
    }

    fn with_outcome(name: impl Into<String>, outcome: TestOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            duration_ms: 0,
            warnings: Vec::new(),
        }
    }

    /// Set duration
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Whether the test passed
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.outcome, TestOutcome::Passed)
    }

    /// Whether the test failed
    #[must_use]
    pub const fn failed(&self) -> bool {
        matches!(self.outcome, TestOutcome::Failed { .. })
    }

    /// Whether the test was skipped
    #[must_use]
    pub const fn skipped(&self) -> bool {
        matches!(self.outcome, TestOutcome::Skipped { .. })
    }
}

/// Results from running a test suite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResults {
    /// Suite name
    pub suite_name: String,
    /// Session policy the suite ran under
    pub policy: SessionPolicy,
    /// Individual test results
    pub results: Vec<TestResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Warnings not tied to a single test
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SuiteResults {
    /// Check if no test failed
    #[must_use]
    pub fn all_passed(&self) -> bool {
        !self.results.iter().any(TestResult::failed)
    }

    /// Count passed tests
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    /// Count failed tests
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    /// Count skipped tests
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.skipped()).count()
    }

    /// Get total test count
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Get failed tests
    #[must_use]
    pub fn failures(&self) -> Vec<&TestResult> {
        self.results.iter().filter(|r| r.failed()).collect()
    }

    /// Look up a result by test name
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> EnsayoResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Test harness for running suites
#[derive(Debug, Default)]
pub struct TestHarness {
    /// Device the suite runs on
    pub device: DeviceProfile,
    /// Stop on first failure, in addition to the suite's own setting
    pub fail_fast: bool,
    intents: IntentRecorder,
    metrics: Option<Arc<dyn MetricsBackend>>,
    context: ExecutionContext,
}

impl TestHarness {
    /// Create a new test harness
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable fail-fast mode
    #[must_use]
    pub const fn with_fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    /// Set the device profile
    #[must_use]
    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = device;
        self
    }

    /// Use this intent recorder; its sink must be wired into the factory
    #[must_use]
    pub fn with_intents(mut self, intents: IntentRecorder) -> Self {
        self.intents = intents;
        self
    }

    /// Attach a metrics backend
    #[must_use]
    pub fn with_metrics(mut self, metrics: impl MetricsBackend + 'static) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Poll on a UI thread instead of the caller thread
    #[must_use]
    pub fn with_ui_thread(mut self, ui: UiThread) -> Self {
        self.context = ExecutionContext::Ui(ui);
        self
    }

    /// Intent recorder handed to tests
    #[must_use]
    pub const fn intents(&self) -> &IntentRecorder {
        &self.intents
    }

    /// Run a test suite with applications from `factory`
    ///
    /// # Errors
    ///
    /// `Config` if the suite configuration is invalid. Test failures are
    /// reported in the results, not as errors.
    pub fn run(
        &self,
        suite: &TestSuite,
        factory: impl AppFactory + 'static,
    ) -> EnsayoResult<SuiteResults> {
        suite.config.validate()?;
        let start = Instant::now();
        let policy = suite.config.effective_policy();
        let fail_fast = self.fail_fast || suite.config.fail_fast;
        let manager = SessionManager::from_config(factory, &suite.config);
        let poll_options = PollOptions::from(suite.config.poll);
        let mut results = Vec::with_capacity(suite.tests.len());
        let mut warnings = Vec::new();

        info!(suite = %suite.name, %policy, tests = suite.tests.len(), "suite started");

        let suite_skip = self.device.first_unsatisfied(&suite.config.restrictions);
        let mut stopped = false;

        for test in &suite.tests {
            if let Some(restriction) = suite_skip {
                results.push(TestResult::skip(&test.name, format!("suite requires {restriction}")));
                continue;
            }
            if stopped {
                results.push(TestResult::skip(&test.name, "not run after earlier failure"));
                continue;
            }
            if let Some(restriction) = self.device.first_unsatisfied(&test.restrictions) {
                info!(test = %test.name, %restriction, "test skipped");
                results.push(TestResult::skip(&test.name, format!("requires {restriction}")));
                continue;
            }

            let result = self.run_test(&manager, policy, poll_options, test);
            if result.failed() && fail_fast {
                stopped = true;
            }
            results.push(result);
        }

        if let Err(e) = manager.end_batch() {
            warn!(suite = %suite.name, error = %e, "ending batch failed");
            warnings.push(e.to_string());
        }
        warnings.extend(manager.take_warnings().iter().map(ToString::to_string));

        let suite_results = SuiteResults {
            suite_name: suite.name.clone(),
            policy,
            results,
            duration_ms: start.elapsed().as_millis() as u64,
            warnings,
        };
        info!(
            suite = %suite.name,
            passed = suite_results.passed_count(),
            failed = suite_results.failed_count(),
            skipped = suite_results.skipped_count(),
            "suite finished"
        );
        Ok(suite_results)
    }

    fn run_test(
        &self,
        manager: &SessionManager,
        policy: SessionPolicy,
        poll_options: PollOptions,
        test: &TestCase,
    ) -> TestResult {
        let start = Instant::now();
        info!(test = %test.name, "test started");

        let session = match manager.acquire(policy) {
            Ok(session) => session,
            Err(e) => {
                warn!(test = %test.name, error = %e, "no session for test");
                return TestResult::fail(&test.name, e.to_string()).with_duration(start.elapsed());
            }
        };

        let cancel = CancellationToken::new();
        let mut context = TestContext {
            name: &test.name,
            session,
            intents: &self.intents,
            metrics: self.metrics.clone(),
            poller: ConditionPoller::new()
                .with_context(self.context.clone())
                .with_options(poll_options)
                .with_cancellation(cancel.clone()),
        };

        let body = &*test.body;
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut context)));
        cancel.cancel();
        drop(context);

        let mut result = match outcome {
            Ok(Ok(())) => TestResult::pass(&test.name),
            Ok(Err(e)) => TestResult::fail(&test.name, e.to_string()),
            Err(payload) => TestResult::fail(
                &test.name,
                format!("panicked: {}", panic_message(payload.as_ref())),
            ),
        }
        .with_duration(start.elapsed());
        result.warnings = manager
            .take_warnings()
            .iter()
            .map(ToString::to_string)
            .collect();

        info!(test = %test.name, outcome = ?result.outcome, duration_ms = result.duration_ms, "test finished");
        result
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{BatchScope, DeviceRestriction};
    use crate::histogram::HistogramWatcher;
    use crate::intent::{has_component, Intent};
    use crate::mock::{InMemoryMetrics, MockAppFactory, MockEffect};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passing(name: &str) -> TestCase {
        TestCase::new(name, |_ctx: &mut TestContext<'_>| Ok(()))
    }

    mod result_tests {
        use super::*;

        #[test]
        fn test_counts() {
            let results = SuiteResults {
                suite_name: "s".into(),
                policy: SessionPolicy::FreshPerTest,
                results: vec![
                    TestResult::pass("a"),
                    TestResult::fail("b", "boom"),
                    TestResult::skip("c", "tablet only"),
                ],
                duration_ms: 0,
                warnings: Vec::new(),
            };
            assert_eq!(results.total(), 3);
            assert_eq!(results.passed_count(), 1);
            assert_eq!(results.failed_count(), 1);
            assert_eq!(results.skipped_count(), 1);
            assert!(!results.all_passed());
            assert_eq!(results.failures()[0].name, "b");
        }

        #[test]
        fn test_json_shape() {
            let results = SuiteResults {
                suite_name: "s".into(),
                policy: SessionPolicy::ReusedAcrossClass,
                results: vec![TestResult::fail("b", "boom")],
                duration_ms: 5,
                warnings: Vec::new(),
            };
            let json = results.to_json().unwrap();
            assert!(json.contains(r#""status": "failed""#));
            assert!(json.contains(r#""policy": "reused_across_class""#));
            assert!(!json.contains("warnings"));

            let back: SuiteResults = serde_json::from_str(&json).unwrap();
            assert_eq!(back, results);
        }
    }

    mod run_tests {
        use super::*;

        #[test]
        fn test_runs_all_tests() {
            let suite = TestSuite::new("basic")
                .with_test(passing("a"))
                .with_test(TestCase::new("b", |_ctx: &mut TestContext<'_>| {
                    Err(EnsayoError::app("broken"))
                }));
            let results = TestHarness::new()
                .run(&suite, MockAppFactory::new())
                .unwrap();

            assert_eq!(results.passed_count(), 1);
            assert_eq!(results.failed_count(), 1);
            assert!(matches!(
                &results.result("b").unwrap().outcome,
                TestOutcome::Failed { message } if message.contains("broken")
            ));
        }

        #[test]
        fn test_panic_is_failure_and_next_test_runs() {
            let factory = MockAppFactory::new();
            let suite = TestSuite::new("panics")
                .with_test(TestCase::new("boom", |_ctx: &mut TestContext<'_>| {
                    panic!("assertion failed")
                }))
                .with_test(passing("after"));
            let results = TestHarness::new().run(&suite, factory.clone()).unwrap();

            assert!(matches!(
                &results.result("boom").unwrap().outcome,
                TestOutcome::Failed { message } if message.contains("assertion failed")
            ));
            assert!(results.result("after").unwrap().passed());
            assert_eq!(factory.stats().torn_down, 2);
        }

        #[test]
        fn test_fail_fast_skips_rest() {
            let suite = TestSuite::new("ff")
                .with_test(TestCase::new("first", |_ctx: &mut TestContext<'_>| {
                    Err(EnsayoError::app("x"))
                }))
                .with_test(passing("second"));
            let results = TestHarness::new()
                .with_fail_fast()
                .run(&suite, MockAppFactory::new())
                .unwrap();
            assert!(results.result("second").unwrap().skipped());
        }

        #[test]
        fn test_restrictions_skip() {
            let suite = TestSuite::new("restricted")
                .with_test(passing("any"))
                .with_test(passing("tablet").with_restriction(DeviceRestriction::Tablet));
            let results = TestHarness::new()
                .with_device(DeviceProfile::phone())
                .run(&suite, MockAppFactory::new())
                .unwrap();
            assert!(results.result("any").unwrap().passed());
            assert!(matches!(
                &results.result("tablet").unwrap().outcome,
                TestOutcome::Skipped { reason } if reason.contains("tablet")
            ));
        }

        #[test]
        fn test_suite_restriction_skips_everything() {
            let factory = MockAppFactory::new();
            let suite = TestSuite::new("tablet-only")
                .with_config(HarnessConfig::new().with_restriction(DeviceRestriction::Tablet))
                .with_test(passing("a"))
                .with_test(passing("b"));
            let results = TestHarness::new()
                .with_device(DeviceProfile::phone())
                .run(&suite, factory.clone())
                .unwrap();
            assert_eq!(results.skipped_count(), 2);
            assert_eq!(factory.stats().created, 0);
        }

        #[test]
        fn test_batched_suite_reuses_one_application() {
            let factory = MockAppFactory::new()
                .on_action("settings", vec![MockEffect::Navigate("chrome://settings".into())]);
            let baseline_checks = Arc::new(AtomicUsize::new(0));
            let checks = Arc::clone(&baseline_checks);
            let body = move |ctx: &mut TestContext<'_>| {
                if ctx.session().current_state()?.is_baseline("about:blank") {
                    checks.fetch_add(1, Ordering::SeqCst);
                }
                ctx.session().issue_action("settings")
            };
            let suite = TestSuite::new("batched")
                .with_config(HarnessConfig::new().with_batch(BatchScope::PerClass))
                .with_test(TestCase::new("one", body.clone()))
                .with_test(TestCase::new("two", body.clone()))
                .with_test(TestCase::new("three", body));

            let results = TestHarness::new().run(&suite, factory.clone()).unwrap();

            assert!(results.all_passed());
            assert_eq!(results.policy, SessionPolicy::ReusedAcrossClass);
            assert_eq!(baseline_checks.load(Ordering::SeqCst), 3);
            assert_eq!(factory.stats().started, 1);
            assert_eq!(factory.stats().torn_down, 1);
        }

        #[test]
        fn test_context_intents_and_metrics() {
            let intents = IntentRecorder::new();
            let metrics = InMemoryMetrics::new();
            let factory = MockAppFactory::new()
                .with_intents(intents.sink())
                .with_metrics(metrics.clone())
                .on_action(
                    "share",
                    vec![
                        MockEffect::Dispatch(Intent::new("ShareActivity")),
                        MockEffect::record("Share.Clicked", 1),
                    ],
                );
            let suite = TestSuite::new("ctx").with_test(TestCase::new(
                "share",
                |ctx: &mut TestContext<'_>| {
                    let mut watcher = ctx.watch(
                        HistogramWatcher::builder().expect_int_record("Share.Clicked", 1),
                    )?;
                    let mut scope = ctx.intents().start()?;
                    scope.expect(has_component("ShareActivity"), 1);
                    ctx.session().issue_action("share")?;
                    scope.stop()?;
                    watcher.assert_expected()
                },
            ));

            let results = TestHarness::new()
                .with_intents(intents)
                .with_metrics(metrics)
                .run(&suite, factory)
                .unwrap();
            assert!(results.all_passed(), "{results:?}");
        }

        #[test]
        fn test_missing_metrics_is_usage_error() {
            let suite = TestSuite::new("m").with_test(TestCase::new(
                "needs-metrics",
                |ctx: &mut TestContext<'_>| ctx.metrics().map(|_| ()),
            ));
            let results = TestHarness::new()
                .run(&suite, MockAppFactory::new())
                .unwrap();
            assert_eq!(results.failed_count(), 1);
        }

        #[test]
        fn test_reset_warning_attached_to_test() {
            let factory = MockAppFactory::new();
            factory.fail_next_resets(1);
            let suite = TestSuite::new("warn")
                .with_config(HarnessConfig::new().with_batch(BatchScope::UnitTests))
                .with_test(passing("a"))
                .with_test(passing("b"));
            let results = TestHarness::new().run(&suite, factory).unwrap();

            assert!(results.all_passed());
            assert_eq!(results.result("a").unwrap().warnings.len(), 1);
            assert!(results.result("b").unwrap().warnings.is_empty());
        }

        #[test]
        fn test_teardown_failure_attached_to_test() {
            let factory = MockAppFactory::new();
            factory.fail_next_teardowns(1);
            let suite = TestSuite::new("teardown")
                .with_test(passing("a"))
                .with_test(passing("b"));
            let results = TestHarness::new().run(&suite, factory).unwrap();

            let a = results.result("a").unwrap();
            assert!(a.passed());
            assert_eq!(a.warnings.len(), 1);
            assert!(a.warnings[0].contains("teardown"), "{:?}", a.warnings);
            assert!(results.result("b").unwrap().warnings.is_empty());
            assert!(results.warnings.is_empty());
        }

        #[test]
        fn test_invalid_config_is_error() {
            let suite = TestSuite::new("bad").with_config(HarnessConfig::new().with_baseline_url(""));
            assert!(matches!(
                TestHarness::new().run(&suite, MockAppFactory::new()),
                Err(EnsayoError::Config { .. })
            ));
        }

        #[test]
        fn test_acquire_failure_fails_test() {
            let factory = MockAppFactory::new();
            factory.fail_next_starts(1);
            let suite = TestSuite::new("start").with_test(passing("a")).with_test(passing("b"));
            let results = TestHarness::new().run(&suite, factory).unwrap();
            assert!(results.result("a").unwrap().failed());
            assert!(results.result("b").unwrap().passed());
        }
    }
}
