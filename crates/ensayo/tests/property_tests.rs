//! Property-based tests for session reuse, intent counting and histogram
//! watching.

use ensayo::mock::{InMemoryMetrics, MockAppFactory, MockEffect};
use ensayo::prelude::*;
use proptest::prelude::*;

const BASELINE: &str = "about:blank";
const SETTINGS: &str = "org.chromium.chrome.browser.settings.SettingsActivity";

fn page_effect() -> impl Strategy<Value = MockEffect> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(|h| MockEffect::Navigate(format!("https://{h}.test/"))),
        "[a-z]{1,6}".prop_map(|h| MockEffect::OpenPage(format!("https://{h}.test/"))),
        Just(MockEffect::ClosePage),
        Just(MockEffect::Background),
    ]
}

fn end_states() -> impl Strategy<Value = Vec<Vec<MockEffect>>> {
    prop::collection::vec(prop::collection::vec(page_effect(), 0..6), 1..5)
}

fn reuse_policy() -> impl Strategy<Value = SessionPolicy> {
    prop_oneof![
        Just(SessionPolicy::ReusedAcrossClass),
        Just(SessionPolicy::AutoResetPerTest),
    ]
}

/// Every test of a batch starts from the baseline, whatever the previous
/// test left behind
fn check_reuse(policy: SessionPolicy, end_states: &[Vec<MockEffect>]) -> Result<(), TestCaseError> {
    let factory = MockAppFactory::new();
    let manager = SessionManager::new(factory.clone()).with_baseline_url(BASELINE);

    for effects in end_states {
        factory.script_action("mess", effects.clone());
        let session = manager.acquire(policy).unwrap();
        prop_assert!(session.current_state().unwrap().is_baseline(BASELINE));
        prop_assert_eq!(manager.running_count(), 1);
        session.issue_action("mess").unwrap();
    }

    let session = manager.acquire(policy).unwrap();
    prop_assert!(session.current_state().unwrap().is_baseline(BASELINE));
    drop(session);

    manager.end_batch().unwrap();
    prop_assert_eq!(manager.running_count(), 0);
    let stats = factory.stats();
    prop_assert_eq!(stats.started, stats.torn_down);
    Ok(())
}

// ============================================================================
// Session Properties
// ============================================================================

proptest! {
    /// Reused sessions are indistinguishable from fresh ones at test start
    #[test]
    fn prop_reuse_restores_baseline(
        policy in reuse_policy(),
        states in end_states(),
    ) {
        check_reuse(policy, &states)?;
    }

    /// Auto reset never needs to recreate the application
    #[test]
    fn prop_auto_reset_keeps_process(states in end_states()) {
        let factory = MockAppFactory::new();
        let manager = SessionManager::new(factory.clone());
        for effects in &states {
            factory.script_action("mess", effects.clone());
            let session = manager.acquire(SessionPolicy::AutoResetPerTest).unwrap();
            session.issue_action("mess").unwrap();
        }
        prop_assert_eq!(factory.stats().started, 1);
        prop_assert!(manager.warnings().is_empty());
    }

    /// A second acquire while one is held is always rejected
    #[test]
    fn prop_single_active_session(
        first in reuse_policy(),
        second in reuse_policy(),
    ) {
        let manager = SessionManager::new(MockAppFactory::new());
        let _held = manager.acquire(first).unwrap();
        let rejected = manager.acquire(second).is_err();
        prop_assert!(rejected);
        prop_assert_eq!(manager.running_count(), 1);
    }
}

// ============================================================================
// Intent Properties
// ============================================================================

proptest! {
    /// expect(m, N) holds for exactly N matches and reports N otherwise
    #[test]
    fn prop_intent_count_is_exact(matching in 0usize..8, other in 0usize..8) {
        let recorder = IntentRecorder::new();
        let sink = recorder.sink();
        let mut scope = recorder.start().unwrap();
        for _ in 0..matching {
            sink.dispatch(Intent::new(SETTINGS).with_extra("show_fragment", "Autofill"));
        }
        for _ in 0..other {
            sink.dispatch(Intent::new(SETTINGS).with_extra("show_fragment", "Privacy"));
        }

        let matcher = all_of(vec![
            has_component(SETTINGS),
            has_extra("show_fragment", "Autofill"),
        ]);
        prop_assert!(scope.assert_intended(&matcher, matching).is_ok());

        scope.expect(matcher, matching + 1);
        match scope.stop() {
            Err(EnsayoError::AssertionMismatch { actual, captured, .. }) => {
                prop_assert_eq!(actual, matching.to_string());
                prop_assert_eq!(captured.len(), matching + other);
            }
            result => prop_assert!(false, "expected mismatch, got {:?}", result),
        }
    }

    /// Nothing dispatched outside a recording scope is ever counted
    #[test]
    fn prop_inactive_dispatch_ignored(before in 0usize..5, inside in 0usize..5) {
        let recorder = IntentRecorder::new();
        let sink = recorder.sink();
        for _ in 0..before {
            sink.dispatch(Intent::new(SETTINGS));
        }
        let scope = recorder.start().unwrap();
        for _ in 0..inside {
            sink.dispatch(Intent::new(SETTINGS));
        }
        prop_assert_eq!(scope.captured().len(), inside);
        prop_assert_eq!(recorder.ignored_count(), before);
    }
}

// ============================================================================
// Histogram Properties
// ============================================================================

proptest! {
    /// Only records made after arming are verified
    #[test]
    fn prop_watcher_sees_only_new_records(
        earlier in prop::collection::vec(-5i64..5, 0..6),
        values in prop::collection::vec(-5i64..5, 1..6),
    ) {
        let metrics = InMemoryMetrics::new();
        for v in &earlier {
            metrics.record("Test.Metric", *v);
        }
        let mut watcher = HistogramWatcher::builder()
            .expect_int_records("Test.Metric", &values)
            .build(metrics.clone())
            .unwrap();
        for v in &values {
            metrics.record("Test.Metric", *v);
        }
        prop_assert_eq!(watcher.recorded_since_arming("Test.Metric").len(), values.len());
        prop_assert!(watcher.assert_expected().is_ok());
        prop_assert_eq!(watcher.state(), WatcherState::Consumed);
    }

    /// One record too many fails unless extra records are allowed
    #[test]
    fn prop_extra_record_detected(value in -5i64..5, allow in prop::bool::ANY) {
        let metrics = InMemoryMetrics::new();
        let mut builder = HistogramWatcher::builder().expect_int_record("Test.Metric", value);
        if allow {
            builder = builder.allow_extra_records("Test.Metric");
        }
        let mut watcher = builder.build(metrics.clone()).unwrap();
        metrics.record("Test.Metric", value);
        metrics.record("Test.Metric", value + 1);
        prop_assert_eq!(watcher.assert_expected().is_ok(), allow);
    }
}

// ============================================================================
// Strategies shipped with the mock module
// ============================================================================

#[cfg(feature = "proptest")]
mod shipped_strategies {
    use super::*;
    use ensayo::mock::{any_end_state, intent_batch};

    proptest! {
        #[test]
        fn prop_reuse_with_shipped_end_states(
            policy in reuse_policy(),
            states in prop::collection::vec(any_end_state(), 1..4),
        ) {
            check_reuse(policy, &states)?;
        }

        #[test]
        fn prop_any_matches_every_intent(batch in intent_batch()) {
            let recorder = IntentRecorder::new();
            let sink = recorder.sink();
            let scope = recorder.start().unwrap();
            for intent in &batch {
                sink.dispatch(intent.clone());
            }
            prop_assert!(scope.assert_intended(&ensayo::intent::any(), batch.len()).is_ok());
            prop_assert!(scope.stop().is_ok());
        }
    }
}

#[test]
fn test_standard_end_states_restore_baseline() {
    for policy in [SessionPolicy::ReusedAcrossClass, SessionPolicy::AutoResetPerTest] {
        check_reuse(policy, &ensayo::mock::standard_end_states()).unwrap();
    }
}
