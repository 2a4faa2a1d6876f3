//! Application-under-test control surface.
//!
//! The harness never implements the application; it drives it through
//! [`AppUnderTest`] and creates instances through an [`AppFactory`].

use crate::config::HarnessConfig;
use crate::result::EnsayoResult;
use serde::{Deserialize, Serialize};

/// Observable state of the application under test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// URL of the foreground page, if any
    pub url: Option<String>,
    /// Number of open pages (tabs)
    pub page_count: usize,
    /// Whether the application is in the foreground
    pub foreground: bool,
}

impl AppState {
    /// State with a single foreground page at `url`
    #[must_use]
    pub fn at(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            page_count: 1,
            foreground: true,
        }
    }

    /// Whether this state is the documented baseline for `baseline_url`
    #[must_use]
    pub fn is_baseline(&self, baseline_url: &str) -> bool {
        self.foreground && self.page_count == 1 && self.url.as_deref() == Some(baseline_url)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "url={} pages={} foreground={}",
            self.url.as_deref().unwrap_or("<none>"),
            self.page_count,
            self.foreground
        )
    }
}

/// Options applied when the application is started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Resolved command-line switches
    pub switches: Vec<String>,
}

impl LaunchOptions {
    /// Build launch options from the harness configuration
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        let mut switches = config.command_line.resolve();
        switches.extend(config.features.to_switches());
        Self { switches }
    }

    /// Whether a switch (by name) is present
    #[must_use]
    pub fn has_switch(&self, name: &str) -> bool {
        self.switches
            .iter()
            .any(|s| s.split_once('=').map_or(s.as_str(), |(n, _)| n) == name)
    }
}

/// Lifecycle control of one application-under-test instance
pub trait AppUnderTest: Send {
    /// Start the application, optionally on a URL
    fn start(&mut self, options: &LaunchOptions, url: Option<&str>) -> EnsayoResult<()>;

    /// Read the current observable state
    fn current_state(&self) -> EnsayoResult<AppState>;

    /// Trigger a named user-level action (click, deep link, ...)
    fn issue_action(&mut self, action_id: &str) -> EnsayoResult<()>;

    /// Navigate the foreground page to `url`
    fn navigate(&mut self, url: &str) -> EnsayoResult<()>;

    /// Drop all per-test state (pages, dialogs); the process stays alive
    fn reset_state(&mut self) -> EnsayoResult<()>;

    /// Tear the application down
    fn teardown(&mut self) -> EnsayoResult<()>;
}

/// Creates application instances for the session manager
pub trait AppFactory: Send + Sync {
    /// Create a new, not yet started, application instance
    fn create(&self) -> EnsayoResult<Box<dyn AppUnderTest>>;
}

impl<F> AppFactory for F
where
    F: Fn() -> EnsayoResult<Box<dyn AppUnderTest>> + Send + Sync,
{
    fn create(&self) -> EnsayoResult<Box<dyn AppUnderTest>> {
        self()
    }
}
