//! Ensayo: Test-Session Orchestration for Instrumented Applications
//!
//! Ensayo (Spanish: "rehearsal") runs the plumbing around an instrumented
//! test: it starts, reuses and resets the application under test, records
//! the launch requests the application sends out, polls for asynchronous
//! state, and checks metric emissions around an action.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TestHarness                             │
//! │   ┌────────────────┐   acquire / release   ┌──────────────┐  │
//! │   │ SessionManager │──────────────────────►│ AppUnderTest │  │
//! │   └────────────────┘                       └──────┬───────┘  │
//! │                                     intents │     │ samples  │
//! │   ┌────────────────┐   ┌─────────────────┐  │     │          │
//! │   │ IntentRecorder │◄──┤   IntentSink    │◄─┘     ▼          │
//! │   └────────────────┘   └─────────────────┘  ┌──────────────┐ │
//! │   ┌────────────────┐   ┌─────────────────┐  │MetricsBackend│ │
//! │   │ConditionPoller │   │HistogramWatcher │─►└──────────────┘ │
//! │   └────────────────┘   └─────────────────┘                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use ensayo::intent::{all_of, has_component, has_extra, Intent};
//! use ensayo::mock::{InMemoryMetrics, MockAppFactory, MockEffect};
//! use ensayo::{HistogramWatcher, IntentRecorder, SessionManager, SessionPolicy};
//!
//! let intents = IntentRecorder::new();
//! let metrics = InMemoryMetrics::new();
//! let factory = MockAppFactory::new()
//!     .with_intents(intents.sink())
//!     .with_metrics(metrics.clone())
//!     .on_action("autofill_settings", vec![
//!         MockEffect::Dispatch(
//!             Intent::new("SettingsActivity").with_extra("show_fragment", "AutofillOptionsFragment"),
//!         ),
//!         MockEffect::record("Autofill.Settings.Opened", 1),
//!     ]);
//!
//! let manager = SessionManager::new(factory);
//! let session = manager.acquire(SessionPolicy::FreshPerTest)?;
//!
//! let mut watcher = HistogramWatcher::single_record("Autofill.Settings.Opened", 1, metrics)?;
//! let mut scope = intents.start()?;
//! scope.expect(
//!     all_of(vec![
//!         has_component("SettingsActivity"),
//!         has_extra("show_fragment", "AutofillOptionsFragment"),
//!     ]),
//!     1,
//! );
//!
//! session.issue_action("autofill_settings")?;
//!
//! scope.stop()?;
//! watcher.assert_expected()?;
//! # Ok::<(), ensayo::EnsayoError>(())
//! ```

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

mod app;
pub mod config;
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod harness;

/// Histogram Watchers
///
/// Arm metric expectations before an action, verify them once after it.
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod histogram;

/// Intent Recording
///
/// Capture and verify outbound launch requests.
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod intent;
pub mod logging;

/// In-memory collaborators for tests
#[allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::doc_markdown
)]
pub mod mock;

/// Condition Polling
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod poll;
mod result;

/// Session Management
#[allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod session;

pub use app::{AppFactory, AppState, AppUnderTest, LaunchOptions};
pub use config::{
    BatchScope, CommandLineFlags, DeviceProfile, DeviceRestriction, FeatureOverrides, FormFactor,
    HarnessConfig, PollDefaults, Verbosity, DEFAULT_BASELINE_URL,
};
pub use harness::{
    SuiteResults, TestBody, TestCase, TestContext, TestHarness, TestOutcome, TestResult, TestSuite,
};
pub use histogram::{
    HistogramWatcher, HistogramWatcherBuilder, MetricExpectation, MetricsBackend, WatcherState,
};
pub use intent::{
    ActivityResult, ExtraValue, Intent, IntentMatcher, IntentRecorder, IntentSink, RecordingScope,
};
pub use logging::{init_tracing, LogFormat};
pub use poll::{
    poll_caller_thread, poll_ui_thread, poll_until, CancellationToken, CheckResult,
    ConditionPoller, Criteria, ExecutionContext, PollOptions, PollReport, UiThread,
    MIN_POLL_INTERVAL,
};
pub use result::{EnsayoError, EnsayoResult};
pub use session::{
    SessionGuard, SessionId, SessionInfo, SessionManager, SessionPolicy, SessionState,
    SessionStats, SessionWarning,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::intent::{
        all_of, any, any_of, has_action, has_component, has_data, has_data_prefix, has_extra,
        has_extra_key, has_package, not,
    };
    pub use super::*;
}
