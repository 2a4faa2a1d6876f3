//! Scriptable In-Memory Application
//!
//! [`MockApp`] models a browser-like application as a stack of pages.
//! Named actions run scripted [`MockEffect`]s: navigation, opening pages,
//! dispatching intents and emitting metrics, optionally after a delay so
//! tests can exercise polling. Faults are injected through the factory.

use crate::app::{AppFactory, AppState, AppUnderTest, LaunchOptions};
use crate::histogram::MetricsBackend;
use crate::intent::{ActivityResult, Intent, IntentSink};
use crate::mock::InMemoryMetrics;
use crate::result::{EnsayoError, EnsayoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Page shown when the application starts without a URL or after a full reset
pub const NEW_TAB_URL: &str = "chrome://newtab/";

/// One scripted consequence of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MockEffect {
    /// Navigate the foreground page
    Navigate(String),
    /// Open an additional page in the foreground
    OpenPage(String),
    /// Close the foreground page
    ClosePage,
    /// Move the application to the background
    Background,
    /// Dispatch an intent
    Dispatch(Intent),
    /// Emit a metric sample
    Record {
        /// Metric name
        name: String,
        /// Sample value
        value: i64,
    },
    /// Fail the action
    Fail(String),
    /// Apply an effect later, on a background thread
    Delayed {
        /// Delay in milliseconds
        delay_ms: u64,
        /// Effect to apply
        effect: Box<MockEffect>,
    },
}

impl MockEffect {
    /// Emit a metric sample
    #[must_use]
    pub fn record(name: impl Into<String>, value: i64) -> Self {
        Self::Record {
            name: name.into(),
            value,
        }
    }

    /// Apply `self` after `delay_ms`
    #[must_use]
    pub fn after(self, delay_ms: u64) -> Self {
        Self::Delayed {
            delay_ms,
            effect: Box::new(self),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Pages {
    stack: Vec<String>,
    foreground: bool,
}

impl Pages {
    fn state(&self) -> AppState {
        AppState {
            url: self.stack.last().cloned(),
            page_count: self.stack.len(),
            foreground: self.foreground,
        }
    }
}

/// Where effects land
#[derive(Debug, Clone)]
struct EffectTarget {
    pages: Arc<Mutex<Pages>>,
    /// Bumped on start, full reset and teardown; delayed effects scheduled
    /// under an older epoch are dropped
    epoch: Arc<AtomicU64>,
    results: Arc<Mutex<Vec<ActivityResult>>>,
    intents: Option<IntentSink>,
    metrics: Option<InMemoryMetrics>,
}

impl EffectTarget {
    fn pages(&self) -> MutexGuard<'_, Pages> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn advance_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn apply(&self, effect: &MockEffect) -> EnsayoResult<()> {
        match effect {
            MockEffect::Navigate(url) => {
                let mut pages = self.pages();
                pages.stack.pop();
                pages.stack.push(url.clone());
                pages.foreground = true;
            }
            MockEffect::OpenPage(url) => {
                let mut pages = self.pages();
                pages.stack.push(url.clone());
                pages.foreground = true;
            }
            MockEffect::ClosePage => {
                self.pages().stack.pop();
            }
            MockEffect::Background => self.pages().foreground = false,
            MockEffect::Dispatch(intent) => {
                let sink = self
                    .intents
                    .as_ref()
                    .ok_or_else(|| EnsayoError::app("no intent sink attached"))?;
                if let Some(result) = sink.dispatch(intent.clone()) {
                    self.results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(result);
                }
            }
            MockEffect::Record { name, value } => {
                self.metrics
                    .as_ref()
                    .ok_or_else(|| EnsayoError::app("no metrics backend attached"))?
                    .record(name.clone(), *value);
            }
            MockEffect::Fail(message) => return Err(EnsayoError::app(message.clone())),
            MockEffect::Delayed { delay_ms, effect } => {
                let target = self.clone();
                let effect = (**effect).clone();
                let delay = Duration::from_millis(*delay_ms);
                let scheduled = self.epoch();
                thread::spawn(move || {
                    thread::sleep(delay);
                    if target.epoch() != scheduled {
                        debug!(?effect, "delayed effect dropped, application restarted or reset");
                        return;
                    }
                    if let Err(e) = target.apply(&effect) {
                        debug!(error = %e, "delayed effect failed");
                    }
                });
            }
        }
        Ok(())
    }
}

/// Counters across every instance a factory created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockStats {
    /// Instances created
    pub created: usize,
    /// Successful starts
    pub started: usize,
    /// Teardowns
    pub torn_down: usize,
    /// Successful full resets
    pub resets: usize,
    /// Actions issued
    pub actions: usize,
}

#[derive(Debug, Default)]
struct Faults {
    starts: usize,
    resets: usize,
    teardowns: usize,
    navigations: usize,
    ignored_navigations: usize,
}

fn take(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

#[derive(Debug, Default)]
struct FactoryShared {
    stats: MockStats,
    faults: Faults,
    last_launch: Option<LaunchOptions>,
}

/// Creates [`MockApp`]s sharing one action script and fault plan
#[derive(Debug, Clone, Default)]
pub struct MockAppFactory {
    script: Arc<Mutex<HashMap<String, Vec<MockEffect>>>>,
    shared: Arc<Mutex<FactoryShared>>,
    results: Arc<Mutex<Vec<ActivityResult>>>,
    intents: Option<IntentSink>,
    metrics: Option<InMemoryMetrics>,
}

impl MockAppFactory {
    /// Create a factory with an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the effects of an action
    #[must_use]
    pub fn on_action(self, action_id: impl Into<String>, effects: Vec<MockEffect>) -> Self {
        self.script_action(action_id, effects);
        self
    }

    /// Script the effects of an action on an existing factory
    pub fn script_action(&self, action_id: impl Into<String>, effects: Vec<MockEffect>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action_id.into(), effects);
    }

    /// Dispatch intents to `sink`
    #[must_use]
    pub fn with_intents(mut self, sink: IntentSink) -> Self {
        self.intents = Some(sink);
        self
    }

    /// Emit metrics into `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: InMemoryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn shared(&self) -> MutexGuard<'_, FactoryShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` starts fail
    pub fn fail_next_starts(&self, n: usize) {
        self.shared().faults.starts += n;
    }

    /// Make the next `n` full resets fail
    pub fn fail_next_resets(&self, n: usize) {
        self.shared().faults.resets += n;
    }

    /// Make the next `n` teardowns fail; the application stops regardless
    pub fn fail_next_teardowns(&self, n: usize) {
        self.shared().faults.teardowns += n;
    }

    /// Make the next `n` navigations fail
    pub fn fail_next_navigations(&self, n: usize) {
        self.shared().faults.navigations += n;
    }

    /// Make the next `n` navigations silently do nothing
    pub fn ignore_next_navigations(&self, n: usize) {
        self.shared().faults.ignored_navigations += n;
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> MockStats {
        self.shared().stats
    }

    /// Launch options of the most recent start
    #[must_use]
    pub fn last_launch(&self) -> Option<LaunchOptions> {
        self.shared().last_launch.clone()
    }

    /// Results handed back by stubbed intents, oldest first
    #[must_use]
    pub fn activity_results(&self) -> Vec<ActivityResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Metrics store, if attached
    #[must_use]
    pub fn metrics(&self) -> Option<&InMemoryMetrics> {
        self.metrics.as_ref()
    }
}

impl AppFactory for MockAppFactory {
    fn create(&self) -> EnsayoResult<Box<dyn AppUnderTest>> {
        self.shared().stats.created += 1;
        Ok(Box::new(MockApp {
            factory: self.clone(),
            target: EffectTarget {
                pages: Arc::new(Mutex::new(Pages::default())),
                epoch: Arc::new(AtomicU64::new(0)),
                results: Arc::clone(&self.results),
                intents: self.intents.clone(),
                metrics: self.metrics.clone(),
            },
            running: false,
        }))
    }
}

/// In-memory application under test
#[derive(Debug)]
pub struct MockApp {
    factory: MockAppFactory,
    target: EffectTarget,
    running: bool,
}

impl MockApp {
    fn ensure_running(&self) -> EnsayoResult<()> {
        if self.running {
            Ok(())
        } else {
            Err(EnsayoError::app("application is not running"))
        }
    }
}

impl AppUnderTest for MockApp {
    fn start(&mut self, options: &LaunchOptions, url: Option<&str>) -> EnsayoResult<()> {
        {
            let mut shared = self.factory.shared();
            if take(&mut shared.faults.starts) {
                return Err(EnsayoError::app("injected start failure"));
            }
            shared.stats.started += 1;
            shared.last_launch = Some(options.clone());
        }
        self.target.advance_epoch();
        let mut pages = self.target.pages();
        pages.stack = vec![url.unwrap_or(NEW_TAB_URL).to_string()];
        pages.foreground = true;
        self.running = true;
        Ok(())
    }

    fn current_state(&self) -> EnsayoResult<AppState> {
        self.ensure_running()?;
        Ok(self.target.pages().state())
    }

    fn issue_action(&mut self, action_id: &str) -> EnsayoResult<()> {
        self.ensure_running()?;
        let effects = self
            .factory
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(action_id)
            .cloned()
            .ok_or_else(|| EnsayoError::app(format!("unknown action '{action_id}'")))?;
        self.factory.shared().stats.actions += 1;
        for effect in &effects {
            self.target.apply(effect)?;
        }
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> EnsayoResult<()> {
        self.ensure_running()?;
        {
            let mut shared = self.factory.shared();
            if take(&mut shared.faults.navigations) {
                return Err(EnsayoError::app(format!("injected navigation failure to {url}")));
            }
            if take(&mut shared.faults.ignored_navigations) {
                return Ok(());
            }
        }
        self.target.apply(&MockEffect::Navigate(url.to_string()))
    }

    fn reset_state(&mut self) -> EnsayoResult<()> {
        self.ensure_running()?;
        {
            let mut shared = self.factory.shared();
            if take(&mut shared.faults.resets) {
                return Err(EnsayoError::app("injected reset failure"));
            }
            shared.stats.resets += 1;
        }
        self.target.advance_epoch();
        let mut pages = self.target.pages();
        pages.stack = vec![NEW_TAB_URL.to_string()];
        pages.foreground = true;
        Ok(())
    }

    fn teardown(&mut self) -> EnsayoResult<()> {
        self.running = false;
        self.target.advance_epoch();
        self.target.pages().stack.clear();
        let mut shared = self.factory.shared();
        if take(&mut shared.faults.teardowns) {
            return Err(EnsayoError::app("injected teardown failure"));
        }
        shared.stats.torn_down += 1;
        Ok(())
    }
}

/// Convenience: samples of `name` in the factory's metrics store
#[must_use]
pub fn recorded_samples(factory: &MockAppFactory, name: &str) -> Vec<i64> {
    factory.metrics().map(|m| m.samples(name)).unwrap_or_default()
}
