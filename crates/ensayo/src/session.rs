//! Session Management
//!
//! Start, reuse and reset the application under test around each test.
//!
//! A [`SessionManager`] serves one execution context. It hands out at most
//! one active session at a time through a [`SessionGuard`]; dropping the guard
//! releases the session according to its [`SessionPolicy`]:
//!
//! - `FreshPerTest`: the application is torn down.
//! - `ReusedAcrossClass`: the surviving page is navigated back to the
//!   baseline URL and the session is kept for the next test of the batch.
//! - `AutoResetPerTest`: all application state is cleared, then the page is
//!   navigated to the baseline URL.
//!
//! If a reused session cannot be restored to its baseline it is destroyed
//! and recreated, and a [`SessionWarning::ResetFailure`] is recorded.

use crate::app::{AppFactory, AppState, AppUnderTest, LaunchOptions};
use crate::config::{HarnessConfig, DEFAULT_BASELINE_URL};
use crate::result::{EnsayoError, EnsayoResult};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Batching policy for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Start a fresh application for every test
    FreshPerTest,
    /// Keep the application across tests of a batch, restoring the baseline page
    ReusedAcrossClass,
    /// Keep the application process, clearing all state before each test
    AutoResetPerTest,
}

impl SessionPolicy {
    /// Whether released sessions are kept for the next test
    #[must_use]
    pub const fn is_reused(self) -> bool {
        !matches!(self, Self::FreshPerTest)
    }

    /// Stable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FreshPerTest => "fresh_per_test",
            Self::ReusedAcrossClass => "reused_across_class",
            Self::AutoResetPerTest => "auto_reset_per_test",
        }
    }
}

impl std::fmt::Display for SessionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created but the application has not started
    NotStarted,
    /// Held by a test
    Running,
    /// Idle between tests, waiting to be reused
    Suspended,
    /// Application torn down
    TornDown,
}

/// Session identifier, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Snapshot of a session's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: SessionId,
    /// Correlation ID for logs
    pub trace_id: Uuid,
    /// Policy the session was created under
    pub policy: SessionPolicy,
    /// Current state
    pub state: SessionState,
    /// Number of tests that have held this session
    pub tests_served: usize,
}

/// Warning recorded instead of failing the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionWarning {
    /// A reused session could not be restored and was recreated
    ResetFailure {
        /// Session that was destroyed
        session: SessionId,
        /// What went wrong
        message: String,
    },
    /// Tearing an application down failed
    TeardownFailure {
        /// Session being torn down
        session: SessionId,
        /// What went wrong
        message: String,
    },
}

impl SessionWarning {
    /// Convert to the error it stands for
    #[must_use]
    pub fn to_error(&self) -> EnsayoError {
        match self {
            Self::ResetFailure { session, message } => EnsayoError::ResetFailure {
                session: session.0,
                message: message.clone(),
            },
            Self::TeardownFailure { session, message } => {
                EnsayoError::lifecycle(format!("teardown of {session} failed: {message}"))
            }
        }
    }
}

impl std::fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// Counters for the lifetime of a manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Applications started
    pub created: usize,
    /// Applications torn down
    pub torn_down: usize,
    /// Acquisitions served by an existing session
    pub reused: usize,
    /// Successful baseline restorations
    pub resets: usize,
    /// Restorations that forced a recreate
    pub reset_failures: usize,
}

/// One application-under-test instance and its bookkeeping
struct Session {
    id: SessionId,
    trace_id: Uuid,
    policy: SessionPolicy,
    state: SessionState,
    created_at: Instant,
    tests_served: usize,
    app: Box<dyn AppUnderTest>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            trace_id: self.trace_id,
            policy: self.policy,
            state: self.state,
            tests_served: self.tests_served,
        }
    }
}

#[derive(Default)]
struct ManagerInner {
    /// The single session of this context, held or idle
    slot: Option<Session>,
    /// Session currently held by a test
    held: Option<SessionId>,
    next_id: u64,
    warnings: Vec<SessionWarning>,
    stats: SessionStats,
}

/// Owns the application-under-test sessions of one execution context
pub struct SessionManager {
    factory: Box<dyn AppFactory>,
    launch: LaunchOptions,
    baseline_url: String,
    inner: Mutex<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionManager")
            .field("baseline_url", &self.baseline_url)
            .field("launch", &self.launch)
            .field("held", &inner.held)
            .field("stats", &inner.stats)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with default launch options and baseline
    #[must_use]
    pub fn new(factory: impl AppFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launch: LaunchOptions::default(),
            baseline_url: DEFAULT_BASELINE_URL.to_string(),
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    /// Create a manager configured from a harness configuration
    #[must_use]
    pub fn from_config(factory: impl AppFactory + 'static, config: &HarnessConfig) -> Self {
        Self::new(factory)
            .with_launch_options(LaunchOptions::from_config(config))
            .with_baseline_url(config.baseline_url.clone())
    }

    /// Set launch options
    #[must_use]
    pub fn with_launch_options(mut self, launch: LaunchOptions) -> Self {
        self.launch = launch;
        self
    }

    /// Set the baseline URL reused sessions are restored to
    #[must_use]
    pub fn with_baseline_url(mut self, url: impl Into<String>) -> Self {
        self.baseline_url = url.into();
        self
    }

    /// Baseline URL
    #[must_use]
    pub fn baseline_url(&self) -> &str {
        &self.baseline_url
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a session under `policy`.
    ///
    /// # Errors
    ///
    /// `Lifecycle` if a session is already held in this context or the
    /// application fails to start.
    pub fn acquire(&self, policy: SessionPolicy) -> EnsayoResult<SessionGuard<'_>> {
        let mut inner = self.lock();

        if let Some(held) = inner.held {
            let held_policy = inner.slot.as_ref().map_or(policy, |s| s.policy);
            return Err(EnsayoError::lifecycle(format!(
                "{held} is already active under {held_policy}; cannot acquire under {policy}"
            )));
        }

        if let Some(mut idle) = inner.slot.take() {
            if idle.policy == policy && idle.state == SessionState::Suspended {
                idle.state = SessionState::Running;
                idle.tests_served += 1;
                let id = idle.id;
                debug!(session = %id, %policy, served = idle.tests_served, "reusing session");
                inner.stats.reused += 1;
                inner.held = Some(id);
                inner.slot = Some(idle);
                return Ok(SessionGuard::new(self, id));
            }
            info!(
                session = %idle.id,
                from = %idle.policy,
                to = %policy,
                "policy changed, discarding idle session"
            );
            Self::destroy(&mut inner, idle);
        }

        let mut session = self.start_session(&mut inner, policy)?;
        session.tests_served = 1;
        let id = session.id;
        inner.held = Some(id);
        inner.slot = Some(session);
        Ok(SessionGuard::new(self, id))
    }

    /// Release a session. Releasing an id that is not held is a no-op.
    ///
    /// # Errors
    ///
    /// `Lifecycle` if a fresh-per-test application fails to tear down. The
    /// session is considered gone either way and the failure is also kept
    /// in [`warnings`](Self::warnings).
    pub fn release(&self, id: SessionId) -> EnsayoResult<()> {
        let mut inner = self.lock();
        if inner.held != Some(id) {
            debug!(session = %id, "release of inactive session ignored");
            return Ok(());
        }
        inner.held = None;

        let Some(mut session) = inner.slot.take() else {
            return Ok(());
        };

        if !session.policy.is_reused() {
            return Self::teardown(&mut inner, session)
                .map_err(|e| Self::record_teardown_failure(&mut inner, id, &e));
        }

        match self.restore_baseline(&mut session) {
            Ok(()) => {
                session.state = SessionState::Suspended;
                inner.stats.resets += 1;
                debug!(session = %id, baseline = %self.baseline_url, "session restored");
                inner.slot = Some(session);
            }
            Err(e) => {
                let policy = session.policy;
                warn!(session = %id, error = %e, "reset failed, recreating session");
                let message = match e {
                    EnsayoError::ResetFailure { message, .. } => message,
                    other => other.to_string(),
                };
                inner.warnings.push(SessionWarning::ResetFailure { session: id, message });
                inner.stats.reset_failures += 1;
                Self::destroy(&mut inner, session);
                match self.start_session(&mut inner, policy) {
                    Ok(mut fresh) => {
                        fresh.state = SessionState::Suspended;
                        inner.slot = Some(fresh);
                    }
                    Err(e) => {
                        // Next acquire retries from scratch.
                        warn!(error = %e, "recreating session failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear down any idle session at the end of a batch.
    ///
    /// # Errors
    ///
    /// `Lifecycle` if a session is still held.
    pub fn end_batch(&self) -> EnsayoResult<()> {
        let mut inner = self.lock();
        if let Some(held) = inner.held {
            return Err(EnsayoError::lifecycle(format!(
                "batch ended while {held} is still active"
            )));
        }
        if let Some(idle) = inner.slot.take() {
            info!(session = %idle.id, served = idle.tests_served, "batch ended");
            let id = idle.id;
            return Self::teardown(&mut inner, idle).map_err(|e| teardown_error(id, &e));
        }
        Ok(())
    }

    /// Run `f` against the application of a held session.
    ///
    /// `f` must not call back into this manager.
    pub fn with_app<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut dyn AppUnderTest) -> R,
    ) -> EnsayoResult<R> {
        let mut inner = self.lock();
        if inner.held != Some(id) {
            return Err(EnsayoError::usage(format!("{id} is not active")));
        }
        match inner.slot.as_mut() {
            Some(session) if session.id == id => Ok(f(session.app.as_mut())),
            _ => Err(EnsayoError::usage(format!("{id} is not active"))),
        }
    }

    /// Bookkeeping snapshot of the current session, held or idle
    #[must_use]
    pub fn current(&self) -> Option<SessionInfo> {
        self.lock().slot.as_ref().map(Session::info)
    }

    /// Whether a session is held by a test
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().held.is_some()
    }

    /// Number of sessions in the `Running` state (0 or 1)
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.lock()
            .slot
            .iter()
            .filter(|s| s.state == SessionState::Running)
            .count()
    }

    /// Age of the current session
    #[must_use]
    pub fn current_age(&self) -> Option<Duration> {
        self.lock().slot.as_ref().map(|s| s.created_at.elapsed())
    }

    /// Warnings recorded so far
    #[must_use]
    pub fn warnings(&self) -> Vec<SessionWarning> {
        self.lock().warnings.clone()
    }

    /// Drain recorded warnings
    pub fn take_warnings(&self) -> Vec<SessionWarning> {
        std::mem::take(&mut self.lock().warnings)
    }

    /// Lifetime counters
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.lock().stats
    }

    fn start_session(
        &self,
        inner: &mut ManagerInner,
        policy: SessionPolicy,
    ) -> EnsayoResult<Session> {
        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        let app = self
            .factory
            .create()
            .map_err(|e| EnsayoError::lifecycle(format!("creating {id} failed: {e}")))?;
        let mut session = Session {
            id,
            trace_id: Uuid::new_v4(),
            policy,
            state: SessionState::NotStarted,
            created_at: Instant::now(),
            tests_served: 0,
            app,
        };
        if let Err(e) = session
            .app
            .start(&self.launch, Some(self.baseline_url.as_str()))
        {
            let _ = session.app.teardown();
            return Err(EnsayoError::lifecycle(format!("starting {id} failed: {e}")));
        }
        session.state = SessionState::Running;
        inner.stats.created += 1;
        info!(
            session = %id,
            trace_id = %session.trace_id,
            %policy,
            switches = self.launch.switches.len(),
            "session started"
        );
        Ok(session)
    }

    fn restore_baseline(&self, session: &mut Session) -> EnsayoResult<()> {
        if session.policy == SessionPolicy::AutoResetPerTest {
            session.app.reset_state()?;
        }
        session.app.navigate(&self.baseline_url)?;
        let state: AppState = session.app.current_state()?;
        if state.is_baseline(&self.baseline_url) {
            Ok(())
        } else {
            Err(EnsayoError::ResetFailure {
                session: session.id.0,
                message: format!(
                    "expected baseline {} but application is at {state}",
                    self.baseline_url
                ),
            })
        }
    }

    fn teardown(inner: &mut ManagerInner, mut session: Session) -> EnsayoResult<()> {
        let id = session.id;
        let result = session.app.teardown();
        session.state = SessionState::TornDown;
        inner.stats.torn_down += 1;
        info!(session = %id, served = session.tests_served, "session torn down");
        result
    }

    fn destroy(inner: &mut ManagerInner, session: Session) {
        let id = session.id;
        if let Err(e) = Self::teardown(inner, session) {
            Self::record_teardown_failure(inner, id, &e);
        }
    }

    /// Keep a teardown failure as a warning; returns the error to report
    fn record_teardown_failure(
        inner: &mut ManagerInner,
        id: SessionId,
        error: &EnsayoError,
    ) -> EnsayoError {
        warn!(session = %id, error = %error, "teardown failed");
        inner.warnings.push(SessionWarning::TeardownFailure {
            session: id,
            message: error.to_string(),
        });
        teardown_error(id, error)
    }
}

fn teardown_error(id: SessionId, error: &EnsayoError) -> EnsayoError {
    EnsayoError::lifecycle(format!("teardown of {id} failed: {error}"))
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if let Some(session) = inner.slot.take() {
            // Best effort teardown - ignore errors during drop
            let _ = Self::teardown(&mut inner, session);
        }
    }
}

/// Scoped handle to a held session; releases on drop
pub struct SessionGuard<'m> {
    manager: &'m SessionManager,
    id: SessionId,
    released: bool,
}

impl<'m> SessionGuard<'m> {
    fn new(manager: &'m SessionManager, id: SessionId) -> Self {
        Self {
            manager,
            id,
            released: false,
        }
    }

    /// Session ID
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Bookkeeping snapshot
    #[must_use]
    pub fn info(&self) -> Option<SessionInfo> {
        self.manager.current().filter(|s| s.id == self.id)
    }

    /// Run `f` against the application
    pub fn with_app<R>(&self, f: impl FnOnce(&mut dyn AppUnderTest) -> R) -> EnsayoResult<R> {
        self.manager.with_app(self.id, f)
    }

    /// Current application state
    pub fn current_state(&self) -> EnsayoResult<AppState> {
        self.with_app(|app| app.current_state())?
    }

    /// Issue a user-level action
    pub fn issue_action(&self, action_id: &str) -> EnsayoResult<()> {
        debug!(session = %self.id, action = action_id, "issuing action");
        self.with_app(|app| app.issue_action(action_id))?
    }

    /// Navigate the foreground page
    pub fn navigate(&self, url: &str) -> EnsayoResult<()> {
        self.with_app(|app| app.navigate(url))?
    }

    /// Release now instead of at drop; calling it again is a no-op
    pub fn release(&mut self) -> EnsayoResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.manager.release(self.id)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(session = %self.id, error = %e, "release on drop failed");
        }
    }
}

impl std::fmt::Debug for SessionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
