//! Condition Polling
//!
//! Poll a predicate on a chosen execution context until it holds, the
//! timeout elapses, or the enclosing test cancels.
//!
//! The caller blocks on a condition variable between attempts, so a
//! cancellation wakes it immediately. Predicates report failure with a
//! message; the last message is carried in the timeout diagnostic.

use crate::config::{PollDefaults, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_MS};
use crate::result::{EnsayoError, EnsayoResult};
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of a single predicate evaluation; `Err` carries what was seen
pub type CheckResult = Result<(), String>;

/// Shortest wait between evaluations; shorter intervals are raised to it
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// CRITERIA
// =============================================================================

/// Helpers for writing predicates
#[derive(Debug, Clone, Copy)]
pub struct Criteria;

impl Criteria {
    /// Pass when `actual == expected`
    pub fn check_that<T: PartialEq + Debug>(
        description: &str,
        actual: T,
        expected: T,
    ) -> CheckResult {
        if actual == expected {
            Ok(())
        } else {
            Err(format!("{description}: expected {expected:?} but was {actual:?}"))
        }
    }

    /// Pass when `condition` holds
    pub fn check(condition: bool, message: impl Into<String>) -> CheckResult {
        if condition {
            Ok(())
        } else {
            Err(message.into())
        }
    }

    /// Pass when `value` is `Some`
    pub fn check_some<T>(description: &str, value: Option<T>) -> CheckResult {
        value.map(|_| ()).ok_or_else(|| format!("{description}: was None"))
    }
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Wakes and stops any poller waiting on it
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    /// Create an untriggered token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation and wake all waiters
    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    /// Whether cancellation was triggered
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for up to `duration`; returns true if cancelled
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = condvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *cancelled
    }
}

// =============================================================================
// EXECUTION CONTEXTS
// =============================================================================

type Job = Box<dyn FnOnce() + Send>;

struct UiThreadInner {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Drop for UiThreadInner {
    fn drop(&mut self) {
        // Closing the channel ends the loop
        self.sender
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if thread::current().id() != self.thread_id {
                let _ = handle.join();
            }
        }
    }
}

/// Dedicated thread owning application-side state; runs submitted closures
/// one at a time and blocks the submitter until each completes
#[derive(Clone)]
pub struct UiThread {
    inner: Arc<UiThreadInner>,
}

impl Debug for UiThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiThread")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl UiThread {
    /// Spawn the thread
    ///
    /// # Errors
    ///
    /// `Io` if the OS refuses to spawn a thread.
    pub fn spawn(name: impl Into<String>) -> EnsayoResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        })?;
        let thread_id = handle.thread().id();
        debug!(name = %name, "ui thread started");
        Ok(Self {
            inner: Arc::new(UiThreadInner {
                name,
                sender: Mutex::new(Some(sender)),
                handle: Mutex::new(Some(handle)),
                thread_id,
            }),
        })
    }

    /// Thread name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// ID of the owning thread
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Whether the calling thread is this UI thread
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `f` on the UI thread and wait for its result.
    ///
    /// Called from the UI thread itself, `f` runs inline.
    ///
    /// # Errors
    ///
    /// `App` if `f` panicked, `Lifecycle` if the thread is gone.
    pub fn run<R, F>(&self, f: F) -> EnsayoResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return catch_unwind(AssertUnwindSafe(f))
                .map_err(|_| EnsayoError::app(format!("task panicked on {}", self.name())));
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            let _ = reply_tx.send(result);
        });

        {
            let sender = self
                .inner
                .sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = sender.as_ref() else {
                return Err(EnsayoError::lifecycle(format!("{} stopped", self.name())));
            };
            sender
                .send(job)
                .map_err(|_| EnsayoError::lifecycle(format!("{} stopped", self.name())))?;
        }

        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(EnsayoError::app(format!("task panicked on {}", self.name()))),
            Err(_) => Err(EnsayoError::lifecycle(format!("{} stopped", self.name()))),
        }
    }
}

/// Where predicates are evaluated
#[derive(Debug, Clone, Default)]
pub enum ExecutionContext {
    /// Inline on the polling thread
    #[default]
    CallerThread,
    /// On the application's owning thread
    Ui(UiThread),
}

impl ExecutionContext {
    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CallerThread => "caller",
            Self::Ui(_) => "ui",
        }
    }
}

// =============================================================================
// POLLER
// =============================================================================

/// Timeout and interval for polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Timeout in milliseconds
    pub timeout_ms: u64,
    /// Polling interval in milliseconds
    pub interval_ms: u64,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl From<PollDefaults> for PollOptions {
    fn from(defaults: PollDefaults) -> Self {
        Self {
            timeout_ms: defaults.timeout_ms,
            interval_ms: defaults.interval_ms,
        }
    }
}

impl PollOptions {
    /// Create options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout in milliseconds
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set polling interval in milliseconds (0 polls every [`MIN_POLL_INTERVAL`])
    #[must_use]
    pub const fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval as Duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Statistics of a successful poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Time until the predicate held
    pub elapsed: Duration,
    /// Number of evaluations
    pub attempts: usize,
}

/// Polls predicates on an execution context
#[derive(Debug, Clone, Default)]
pub struct ConditionPoller {
    context: ExecutionContext,
    options: PollOptions,
    cancel: CancellationToken,
}

impl ConditionPoller {
    /// Poller on the caller thread with default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Poller on a UI thread with default options
    #[must_use]
    pub fn on_ui_thread(ui: UiThread) -> Self {
        Self::new().with_context(ExecutionContext::Ui(ui))
    }

    /// Set the execution context
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Set options
    #[must_use]
    pub const fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Options
    #[must_use]
    pub const fn options(&self) -> PollOptions {
        self.options
    }

    /// Execution context
    #[must_use]
    pub const fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Token that cancels this poller
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Poll `predicate` on this poller's context.
    ///
    /// # Errors
    ///
    /// `Timeout` with the last failure message, `Cancelled`, or the error of
    /// the execution context.
    pub fn poll<F>(&self, predicate: F) -> EnsayoResult<PollReport>
    where
        F: FnMut() -> CheckResult + Send + 'static,
    {
        self.poll_with(predicate, self.options)
    }

    /// Poll with explicit options
    pub fn poll_with<F>(&self, mut predicate: F, options: PollOptions) -> EnsayoResult<PollReport>
    where
        F: FnMut() -> CheckResult + Send + 'static,
    {
        match &self.context {
            ExecutionContext::CallerThread => {
                run_poll(
                    || Ok(predicate()),
                    options.timeout(),
                    options.interval(),
                    &self.cancel,
                    self.context.name(),
                )
            }
            ExecutionContext::Ui(ui) => {
                let predicate = Arc::new(Mutex::new(predicate));
                run_poll(
                    || {
                        let predicate = Arc::clone(&predicate);
                        ui.run(move || {
                            let mut predicate =
                                predicate.lock().unwrap_or_else(PoisonError::into_inner);
                            (&mut *predicate)()
                        })
                    },
                    options.timeout(),
                    options.interval(),
                    &self.cancel,
                    self.context.name(),
                )
            }
        }
    }

    /// Poll a boolean predicate; `description` becomes the failure message
    pub fn poll_bool<F>(&self, description: &str, mut predicate: F) -> EnsayoResult<PollReport>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let message = format!("{description} was false");
        self.poll(move || Criteria::check(predicate(), message.clone()))
    }
}

fn run_poll(
    mut check: impl FnMut() -> EnsayoResult<CheckResult>,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    context: &str,
) -> EnsayoResult<PollReport> {
    let start = Instant::now();
    let deadline = start + timeout;
    let interval = interval.max(MIN_POLL_INTERVAL);
    let timeout_ms = ceil_millis(timeout);
    let mut attempts = 0;
    let mut last_seen = String::from("predicate never evaluated");

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(start));
        }
        attempts += 1;
        match check()? {
            Ok(()) => {
                let elapsed = start.elapsed();
                debug!(context, attempts, elapsed_ms = elapsed.as_millis() as u64, "condition satisfied");
                return Ok(PollReport { elapsed, attempts });
            }
            Err(seen) => last_seen = seen,
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(context, attempts, timeout_ms, last_seen = %last_seen, "poll timed out");
            return Err(EnsayoError::Timeout {
                ms: timeout_ms,
                last_seen,
            });
        }
        if cancel.wait_timeout(interval.min(deadline - now)) {
            return Err(cancelled(start));
        }
    }
}

/// Whole milliseconds, rounded up so reports never understate the timeout
fn ceil_millis(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(1_000_000) as u64
}

fn cancelled(start: Instant) -> EnsayoError {
    let after_ms = start.elapsed().as_millis() as u64;
    debug!(after_ms, "poll cancelled");
    EnsayoError::Cancelled { after_ms }
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Poll `predicate` inline until it holds or `timeout` elapses
pub fn poll_until<F>(predicate: F, timeout: Duration, interval: Duration) -> EnsayoResult<()>
where
    F: FnMut() -> CheckResult,
{
    let mut predicate = predicate;
    run_poll(
        || Ok(predicate()),
        timeout,
        interval,
        &CancellationToken::new(),
        ExecutionContext::CallerThread.name(),
    )
    .map(|_| ())
}

/// Poll inline with the default timeout and interval
pub fn poll_caller_thread<F>(predicate: F) -> EnsayoResult<()>
where
    F: FnMut() -> CheckResult,
{
    let options = PollOptions::default();
    poll_until(predicate, options.timeout(), options.interval())
}

/// Poll on `ui` with the default timeout and interval
pub fn poll_ui_thread<F>(ui: &UiThread, predicate: F) -> EnsayoResult<()>
where
    F: FnMut() -> CheckResult + Send + 'static,
{
    ConditionPoller::on_ui_thread(ui.clone())
        .poll(predicate)
        .map(|_| ())
}
