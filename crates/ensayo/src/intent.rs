//! Intent Recording
//!
//! Capture outbound launch requests ("intents") the application dispatches
//! while a [`RecordingScope`] is open, and verify them lazily.
//!
//! ```
//! use ensayo::intent::{all_of, has_component, has_extra, Intent, IntentRecorder};
//!
//! let recorder = IntentRecorder::new();
//! let sink = recorder.sink();
//!
//! let mut scope = recorder.start().unwrap();
//! scope.expect(
//!     all_of(vec![
//!         has_component("org.chromium.SettingsActivity"),
//!         has_extra("show_fragment", "AutofillOptionsFragment"),
//!     ]),
//!     1,
//! );
//!
//! sink.dispatch(
//!     Intent::new("org.chromium.SettingsActivity")
//!         .with_extra("show_fragment", "AutofillOptionsFragment"),
//! );
//! scope.stop().unwrap();
//! ```

use crate::result::{EnsayoError, EnsayoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Result code reported to the dispatcher for a successful launch
pub const RESULT_OK: i32 = -1;

/// Result code reported to the dispatcher for a cancelled launch
pub const RESULT_CANCELED: i32 = 0;

// =============================================================================
// Intents
// =============================================================================

/// Value of an intent extra
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    /// Boolean extra
    Bool(bool),
    /// Integer extra
    Int(i64),
    /// String extra
    Str(String),
}

impl From<&str> for ExtraValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ExtraValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ExtraValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for ExtraValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl std::fmt::Display for ExtraValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// An outbound launch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Target component (fully qualified class name)
    pub component: String,
    /// Action
    pub action: Option<String>,
    /// Data URI
    pub data: Option<String>,
    /// Target package
    pub package: Option<String>,
    /// Extras
    pub extras: BTreeMap<String, ExtraValue>,
}

impl Intent {
    /// Create an intent for a component
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            action: None,
            data: None,
            package: None,
            extras: BTreeMap::new(),
        }
    }

    /// Set the action
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the data URI
    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the package
    #[must_use]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    /// Add an extra
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Look up an extra
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&ExtraValue> {
        self.extras.get(key)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Intent {{ cmp={}", self.component)?;
        if let Some(action) = &self.action {
            write!(f, " act={action}")?;
        }
        if let Some(data) = &self.data {
            write!(f, " dat={data}")?;
        }
        if let Some(package) = &self.package {
            write!(f, " pkg={package}")?;
        }
        if !self.extras.is_empty() {
            let extras: Vec<String> = self
                .extras
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " extras={{{}}}", extras.join(", "))?;
        }
        write!(f, " }}")
    }
}

/// Result handed back to the dispatcher of a stubbed intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityResult {
    /// Result code
    pub code: i32,
    /// Optional result payload
    pub data: Option<Intent>,
}

impl ActivityResult {
    /// Successful result without payload
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            code: RESULT_OK,
            data: None,
        }
    }

    /// Cancelled result
    #[must_use]
    pub const fn canceled() -> Self {
        Self {
            code: RESULT_CANCELED,
            data: None,
        }
    }

    /// Attach a payload
    #[must_use]
    pub fn with_data(mut self, data: Intent) -> Self {
        self.data = Some(data);
        self
    }
}

// =============================================================================
// Matchers
// =============================================================================

/// Predicate over intents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IntentMatcher {
    /// Exact component name
    Component(String),
    /// Component name matching a regex
    ComponentRegex(String),
    /// Exact action
    Action(String),
    /// Exact data URI
    Data(String),
    /// Data URI prefix
    DataPrefix(String),
    /// Exact package
    Package(String),
    /// Extra with key and value
    Extra(String, ExtraValue),
    /// Extra key present with any value
    ExtraKey(String),
    /// Every matcher holds
    AllOf(Vec<IntentMatcher>),
    /// At least one matcher holds
    AnyOf(Vec<IntentMatcher>),
    /// Matcher does not hold
    Not(Box<IntentMatcher>),
    /// Match any intent
    Any,
}

impl IntentMatcher {
    /// Check if an intent matches
    #[must_use]
    pub fn matches(&self, intent: &Intent) -> bool {
        match self {
            Self::Component(name) => intent.component == *name,
            Self::ComponentRegex(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(&intent.component))
                .unwrap_or(false),
            Self::Action(action) => intent.action.as_deref() == Some(action.as_str()),
            Self::Data(data) => intent.data.as_deref() == Some(data.as_str()),
            Self::DataPrefix(prefix) => intent
                .data
                .as_deref()
                .is_some_and(|d| d.starts_with(prefix.as_str())),
            Self::Package(package) => intent.package.as_deref() == Some(package.as_str()),
            Self::Extra(key, value) => intent.extra(key) == Some(value),
            Self::ExtraKey(key) => intent.extras.contains_key(key),
            Self::AllOf(matchers) => matchers.iter().all(|m| m.matches(intent)),
            Self::AnyOf(matchers) => matchers.iter().any(|m| m.matches(intent)),
            Self::Not(matcher) => !matcher.matches(intent),
            Self::Any => true,
        }
    }

    /// Combine with another matcher
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::AllOf(mut matchers) => {
                matchers.push(other);
                Self::AllOf(matchers)
            }
            first => Self::AllOf(vec![first, other]),
        }
    }
}

impl std::fmt::Display for IntentMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(f: &mut std::fmt::Formatter<'_>, name: &str, items: &[IntentMatcher]) -> std::fmt::Result {
            let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
            write!(f, "{name}({})", parts.join(", "))
        }
        match self {
            Self::Component(name) => write!(f, "has_component({name})"),
            Self::ComponentRegex(pattern) => write!(f, "has_component_matching(/{pattern}/)"),
            Self::Action(action) => write!(f, "has_action({action})"),
            Self::Data(data) => write!(f, "has_data({data})"),
            Self::DataPrefix(prefix) => write!(f, "has_data_prefix({prefix})"),
            Self::Package(package) => write!(f, "has_package({package})"),
            Self::Extra(key, value) => write!(f, "has_extra({key}, {value})"),
            Self::ExtraKey(key) => write!(f, "has_extra_key({key})"),
            Self::AllOf(items) => join(f, "all_of", items),
            Self::AnyOf(items) => join(f, "any_of", items),
            Self::Not(inner) => write!(f, "not({inner})"),
            Self::Any => write!(f, "any()"),
        }
    }
}

/// Match the component name exactly
#[must_use]
pub fn has_component(name: impl Into<String>) -> IntentMatcher {
    IntentMatcher::Component(name.into())
}

/// Match the component name against a regex
#[must_use]
pub fn has_component_matching(pattern: impl Into<String>) -> IntentMatcher {
    IntentMatcher::ComponentRegex(pattern.into())
}

/// Match the action
#[must_use]
pub fn has_action(action: impl Into<String>) -> IntentMatcher {
    IntentMatcher::Action(action.into())
}

/// Match the data URI exactly
#[must_use]
pub fn has_data(data: impl Into<String>) -> IntentMatcher {
    IntentMatcher::Data(data.into())
}

/// Match the data URI prefix
#[must_use]
pub fn has_data_prefix(prefix: impl Into<String>) -> IntentMatcher {
    IntentMatcher::DataPrefix(prefix.into())
}

/// Match the package
#[must_use]
pub fn has_package(package: impl Into<String>) -> IntentMatcher {
    IntentMatcher::Package(package.into())
}

/// Match an extra key and value
#[must_use]
pub fn has_extra(key: impl Into<String>, value: impl Into<ExtraValue>) -> IntentMatcher {
    IntentMatcher::Extra(key.into(), value.into())
}

/// Match presence of an extra key
#[must_use]
pub fn has_extra_key(key: impl Into<String>) -> IntentMatcher {
    IntentMatcher::ExtraKey(key.into())
}

/// All matchers must hold
#[must_use]
pub fn all_of(matchers: Vec<IntentMatcher>) -> IntentMatcher {
    IntentMatcher::AllOf(matchers)
}

/// Any matcher must hold
#[must_use]
pub fn any_of(matchers: Vec<IntentMatcher>) -> IntentMatcher {
    IntentMatcher::AnyOf(matchers)
}

/// Negate a matcher
#[must_use]
pub fn not(matcher: IntentMatcher) -> IntentMatcher {
    IntentMatcher::Not(Box::new(matcher))
}

/// Match every intent
#[must_use]
pub const fn any() -> IntentMatcher {
    IntentMatcher::Any
}

// =============================================================================
// Recording
// =============================================================================

/// Canned response for matching dispatches
#[derive(Debug, Clone)]
pub struct Stub {
    /// Matcher selecting the intents to answer
    pub matcher: IntentMatcher,
    /// Result returned to the dispatcher
    pub result: ActivityResult,
    /// Number of times this stub answers (None = unlimited)
    pub times: Option<usize>,
    /// Number of times this stub has answered
    pub match_count: usize,
}

impl Stub {
    /// Create a stub
    #[must_use]
    pub const fn new(matcher: IntentMatcher, result: ActivityResult) -> Self {
        Self {
            matcher,
            result,
            times: None,
            match_count: 0,
        }
    }

    /// Limit how many times the stub answers
    #[must_use]
    pub const fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    fn answers(&self, intent: &Intent) -> bool {
        if self.times.is_some_and(|max| self.match_count >= max) {
            return false;
        }
        self.matcher.matches(intent)
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    /// Generation of the open scope, if any
    active: Option<u64>,
    generation: u64,
    captured: Vec<Intent>,
    stubs: Vec<Stub>,
    /// Dispatches seen while no scope was open
    ignored: usize,
}

fn lock(shared: &Mutex<RecorderState>) -> MutexGuard<'_, RecorderState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel the application dispatches intents to
#[derive(Debug, Clone)]
pub struct IntentSink {
    shared: Arc<Mutex<RecorderState>>,
}

impl IntentSink {
    /// Dispatch an intent. Returns the stubbed result, if any.
    pub fn dispatch(&self, intent: Intent) -> Option<ActivityResult> {
        let mut state = lock(&self.shared);
        if state.active.is_none() {
            state.ignored += 1;
            debug!(intent = %intent, "intent dispatched outside recording scope");
            return None;
        }

        let result = state
            .stubs
            .iter_mut()
            .find(|stub| stub.answers(&intent))
            .map(|stub| {
                stub.match_count += 1;
                stub.result.clone()
            });
        debug!(intent = %intent, stubbed = result.is_some(), "intent captured");
        state.captured.push(intent);
        result
    }
}

/// Intercepts intents dispatched through its [`IntentSink`]s
#[derive(Debug, Clone, Default)]
pub struct IntentRecorder {
    shared: Arc<Mutex<RecorderState>>,
}

impl IntentRecorder {
    /// Create a recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink to hand to the application
    #[must_use]
    pub fn sink(&self) -> IntentSink {
        IntentSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Begin interception, clearing earlier captures and stubs.
    ///
    /// # Errors
    ///
    /// `Usage` if a scope is already open.
    pub fn start(&self) -> EnsayoResult<RecordingScope> {
        let mut state = lock(&self.shared);
        if state.active.is_some() {
            return Err(EnsayoError::usage("intent recording already started"));
        }
        state.generation += 1;
        let generation = state.generation;
        state.active = Some(generation);
        state.captured.clear();
        state.stubs.clear();
        info!(generation, "intent recording started");
        Ok(RecordingScope {
            shared: Arc::clone(&self.shared),
            generation,
            expectations: Vec::new(),
            stopped: false,
        })
    }

    /// Whether a scope is open
    #[must_use]
    pub fn is_recording(&self) -> bool {
        lock(&self.shared).active.is_some()
    }

    /// Number of dispatches seen while no scope was open
    #[must_use]
    pub fn ignored_count(&self) -> usize {
        lock(&self.shared).ignored
    }
}

/// Pending `expect` registration
#[derive(Debug, Clone)]
struct Expectation {
    matcher: IntentMatcher,
    times: usize,
}

/// An open interception scope
#[derive(Debug)]
pub struct RecordingScope {
    shared: Arc<Mutex<RecorderState>>,
    generation: u64,
    expectations: Vec<Expectation>,
    stopped: bool,
}

impl RecordingScope {
    /// Register a lazy expectation: exactly `times` captured intents match
    pub fn expect(&mut self, matcher: IntentMatcher, times: usize) -> &mut Self {
        self.expectations.push(Expectation { matcher, times });
        self
    }

    /// Register a lazy expectation of exactly one match
    pub fn expect_once(&mut self, matcher: IntentMatcher) -> &mut Self {
        self.expect(matcher, 1)
    }

    /// Answer matching dispatches with `result`
    pub fn stub(&mut self, matcher: IntentMatcher, result: ActivityResult) -> &mut Self {
        self.add_stub(Stub::new(matcher, result))
    }

    /// Register a prepared stub
    pub fn add_stub(&mut self, stub: Stub) -> &mut Self {
        debug!(matcher = %stub.matcher, code = stub.result.code, "intent stub registered");
        lock(&self.shared).stubs.push(stub);
        self
    }

    /// Intents captured so far, in dispatch order
    #[must_use]
    pub fn captured(&self) -> Vec<Intent> {
        let state = lock(&self.shared);
        if state.active == Some(self.generation) {
            state.captured.clone()
        } else {
            Vec::new()
        }
    }

    /// Captured intents matching `matcher`
    #[must_use]
    pub fn matching(&self, matcher: &IntentMatcher) -> Vec<Intent> {
        self.captured()
            .into_iter()
            .filter(|i| matcher.matches(i))
            .collect()
    }

    /// Assert now that exactly `times` captured intents match
    pub fn assert_intended(&self, matcher: &IntentMatcher, times: usize) -> EnsayoResult<()> {
        check(&self.captured(), matcher, times)
    }

    /// Evaluate all registered expectations without closing the scope
    pub fn verify(&self) -> EnsayoResult<()> {
        self.verify_against(&self.captured())
    }

    fn verify_against(&self, captured: &[Intent]) -> EnsayoResult<()> {
        for expectation in &self.expectations {
            check(captured, &expectation.matcher, expectation.times)?;
        }
        Ok(())
    }

    /// Close the scope and evaluate all registered expectations
    pub fn stop(mut self) -> EnsayoResult<()> {
        let captured = self.close();
        self.verify_against(&captured)
    }

    /// End interception and take this scope's captures in one step, so a
    /// scope started right after cannot be read or cleared by this one
    fn close(&mut self) -> Vec<Intent> {
        self.stopped = true;
        let mut state = lock(&self.shared);
        if state.active != Some(self.generation) {
            return Vec::new();
        }
        state.active = None;
        state.stubs.clear();
        let captured = std::mem::take(&mut state.captured);
        info!(
            generation = self.generation,
            captured = captured.len(),
            "intent recording stopped"
        );
        captured
    }
}

impl Drop for RecordingScope {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.close();
        if !self.expectations.is_empty() {
            warn!(
                pending = self.expectations.len(),
                "recording scope dropped without verifying expectations"
            );
        }
    }
}

fn check(captured: &[Intent], matcher: &IntentMatcher, times: usize) -> EnsayoResult<()> {
    let actual = captured.iter().filter(|i| matcher.matches(i)).count();
    if actual == times {
        return Ok(());
    }
    warn!(%matcher, expected = times, actual, "intent expectation failed");
    Err(EnsayoError::AssertionMismatch {
        expected: format!("{times} intent(s) matching {matcher}"),
        actual: actual.to_string(),
        captured: captured.iter().map(ToString::to_string).collect(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SETTINGS: &str = "org.chromium.chrome.browser.settings.SettingsActivity";
    const FRAGMENT_KEY: &str = "show_fragment";
    const AUTOFILL: &str = "org.chromium.chrome.browser.autofill.settings.AutofillOptionsFragment";

    fn settings_intent() -> Intent {
        Intent::new(SETTINGS).with_extra(FRAGMENT_KEY, AUTOFILL)
    }

    fn settings_matcher() -> IntentMatcher {
        all_of(vec![has_component(SETTINGS), has_extra(FRAGMENT_KEY, AUTOFILL)])
    }

    mod matcher_tests {
        use super::*;

        #[test]
        fn test_component_and_extras() {
            let intent = settings_intent();
            assert!(has_component(SETTINGS).matches(&intent));
            assert!(!has_component("Other").matches(&intent));
            assert!(has_extra(FRAGMENT_KEY, AUTOFILL).matches(&intent));
            assert!(!has_extra(FRAGMENT_KEY, "Other").matches(&intent));
            assert!(has_extra_key(FRAGMENT_KEY).matches(&intent));
            assert!(settings_matcher().matches(&intent));
        }

        #[test]
        fn test_extra_types_are_distinct() {
            let intent = Intent::new("A").with_extra("count", 1).with_extra("flag", true);
            assert!(has_extra("count", 1).matches(&intent));
            assert!(!has_extra("count", "1").matches(&intent));
            assert!(has_extra("flag", true).matches(&intent));
        }

        #[test]
        fn test_action_data_package() {
            let intent = Intent::new("A")
                .with_action("android.intent.action.VIEW")
                .with_data("https://example.com/page")
                .with_package("com.android.chrome");
            assert!(has_action("android.intent.action.VIEW").matches(&intent));
            assert!(has_data("https://example.com/page").matches(&intent));
            assert!(has_data_prefix("https://example.com").matches(&intent));
            assert!(!has_data_prefix("http://").matches(&intent));
            assert!(has_package("com.android.chrome").matches(&intent));
            assert!(!has_action("x").matches(&Intent::new("A")));
        }

        #[test]
        fn test_combinators() {
            let intent = Intent::new("A");
            assert!(any_of(vec![has_component("B"), has_component("A")]).matches(&intent));
            assert!(not(has_component("B")).matches(&intent));
            assert!(any().matches(&intent));
            assert!(all_of(Vec::new()).matches(&intent));
            assert!(!any_of(Vec::new()).matches(&intent));
        }

        #[test]
        fn test_regex_component() {
            let intent = Intent::new(SETTINGS);
            assert!(has_component_matching(r"\.SettingsActivity$").matches(&intent));
            assert!(!has_component_matching("[invalid").matches(&intent));
        }

        #[test]
        fn test_and_flattens() {
            let m = has_component("A").and(has_action("x")).and(has_data("d"));
            match m {
                IntentMatcher::AllOf(items) => assert_eq!(items.len(), 3),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn test_display() {
            assert_eq!(
                all_of(vec![has_component("A"), not(has_extra("k", 2))]).to_string(),
                "all_of(has_component(A), not(has_extra(k, 2)))"
            );
        }
    }

    mod intent_tests {
        use super::*;

        #[test]
        fn test_display() {
            let intent = Intent::new("A").with_action("VIEW").with_extra("k", "v");
            assert_eq!(intent.to_string(), r#"Intent { cmp=A act=VIEW extras={k="v"} }"#);
        }

        #[test]
        fn test_serde_untagged_extras() {
            let intent = Intent::new("A").with_extra("n", 3).with_extra("s", "x");
            let json = serde_json::to_string(&intent).unwrap();
            assert!(json.contains(r#""n":3"#));
            let back: Intent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, intent);
        }
    }

    mod recording_tests {
        use super::*;

        #[test]
        fn test_single_dispatch_recorded_once() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut scope = recorder.start().unwrap();
            scope.expect(settings_matcher(), 1);

            sink.dispatch(settings_intent());

            scope.stop().unwrap();
            assert!(!recorder.is_recording());
        }

        #[test]
        fn test_count_mismatch_reports_actual_and_captured() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut scope = recorder.start().unwrap();
            scope.expect(settings_matcher(), 2);
            sink.dispatch(settings_intent());
            sink.dispatch(Intent::new("Other"));

            match scope.stop().unwrap_err() {
                EnsayoError::AssertionMismatch {
                    expected,
                    actual,
                    captured,
                } => {
                    assert!(expected.starts_with("2 intent(s)"));
                    assert_eq!(actual, "1");
                    assert_eq!(captured.len(), 2);
                    assert!(captured[1].contains("cmp=Other"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn test_dispatch_outside_scope_not_captured() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            sink.dispatch(settings_intent());
            assert_eq!(recorder.ignored_count(), 1);

            let scope = recorder.start().unwrap();
            assert!(scope.captured().is_empty());
            scope.assert_intended(&settings_matcher(), 0).unwrap();
            scope.stop().unwrap();

            sink.dispatch(settings_intent());
            assert_eq!(recorder.ignored_count(), 2);
        }

        #[test]
        fn test_start_clears_prior_captures() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            {
                let _scope = recorder.start().unwrap();
                sink.dispatch(settings_intent());
            }
            let scope = recorder.start().unwrap();
            assert!(scope.captured().is_empty());
        }

        #[test]
        fn test_nested_start_is_usage_error() {
            let recorder = IntentRecorder::new();
            let _scope = recorder.start().unwrap();
            assert!(matches!(
                recorder.start(),
                Err(EnsayoError::Usage { .. })
            ));
        }

        #[test]
        fn test_drop_releases_interception() {
            let recorder = IntentRecorder::new();
            {
                let mut scope = recorder.start().unwrap();
                scope.expect(any(), 5);
            }
            assert!(!recorder.is_recording());
            assert!(recorder.start().is_ok());
        }

        #[test]
        fn test_closed_scope_keeps_its_captures_apart_from_next_scope() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut first = recorder.start().unwrap();
            first.expect(settings_matcher(), 2);
            sink.dispatch(settings_intent());
            sink.dispatch(settings_intent());

            let snapshot = first.close();
            assert!(!recorder.is_recording());

            let second = recorder.start().unwrap();
            sink.dispatch(Intent::new("Other"));

            first.verify_against(&snapshot).unwrap();
            assert!(first.captured().is_empty());
            assert_eq!(second.captured().len(), 1);

            drop(first);
            assert!(recorder.is_recording());
            assert_eq!(second.captured().len(), 1);
            second.assert_intended(&has_component("Other"), 1).unwrap();
            second.stop().unwrap();
        }

        #[test]
        fn test_stop_clears_captures() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let scope = recorder.start().unwrap();
            sink.dispatch(settings_intent());
            scope.stop().unwrap();
            assert!(lock(&recorder.shared).captured.is_empty());
        }

        #[test]
        fn test_verify_keeps_scope_open() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut scope = recorder.start().unwrap();
            scope.expect(has_component("A"), 1);

            assert!(scope.verify().is_err());
            sink.dispatch(Intent::new("A"));
            scope.verify().unwrap();
            assert!(recorder.is_recording());
            scope.stop().unwrap();
        }

        #[test]
        fn test_sink_usable_from_other_thread() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let scope = recorder.start().unwrap();
            std::thread::spawn(move || {
                sink.dispatch(Intent::new("A"));
            })
            .join()
            .unwrap();
            assert_eq!(scope.matching(&has_component("A")).len(), 1);
        }
    }

    mod stub_tests {
        use super::*;

        #[test]
        fn test_stub_answers_matching_dispatch() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut scope = recorder.start().unwrap();
            scope.stub(has_component("Picker"), ActivityResult::ok());

            assert_eq!(
                sink.dispatch(Intent::new("Picker")),
                Some(ActivityResult::ok())
            );
            assert_eq!(sink.dispatch(Intent::new("Other")), None);
            assert_eq!(scope.captured().len(), 2);
        }

        #[test]
        fn test_stub_times_limit() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let mut scope = recorder.start().unwrap();
            scope.add_stub(Stub::new(any(), ActivityResult::canceled()).times(1));

            assert_eq!(
                sink.dispatch(Intent::new("A")).map(|r| r.code),
                Some(RESULT_CANCELED)
            );
            assert_eq!(sink.dispatch(Intent::new("A")), None);
        }

        #[test]
        fn test_stubs_cleared_with_scope() {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            {
                let mut scope = recorder.start().unwrap();
                scope.stub(any(), ActivityResult::ok());
            }
            let _scope = recorder.start().unwrap();
            assert_eq!(sink.dispatch(Intent::new("A")), None);
        }
    }
}
