//! Harness Configuration
//!
//! Explicit configuration for a test suite: batch scope, device restrictions,
//! command-line flags and feature overrides. Loadable from YAML.

use crate::result::{EnsayoError, EnsayoResult};
use crate::session::SessionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Default page a reused session is restored to
pub const DEFAULT_BASELINE_URL: &str = "about:blank";

/// Default polling timeout (3 seconds)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 3_000;

/// Default polling interval (50ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Logging verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Quiet - warnings and errors only
    Quiet,
    /// Normal - lifecycle events
    #[default]
    Normal,
    /// Verbose - every poll and capture
    Verbose,
}

impl Verbosity {
    /// Default `EnvFilter` directive for this level
    #[must_use]
    pub const fn filter_directive(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "info",
            Self::Verbose => "debug",
        }
    }
}

/// How tests of one suite share the application session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchScope {
    /// Every test gets its own session
    #[default]
    None,
    /// Tests of a class share one session, restored between tests
    PerClass,
    /// Lightweight unit tests batched together with a full reset per test
    UnitTests,
}

impl BatchScope {
    /// Session policy implied by this batch scope
    #[must_use]
    pub const fn default_policy(self) -> SessionPolicy {
        match self {
            Self::None => SessionPolicy::FreshPerTest,
            Self::PerClass => SessionPolicy::ReusedAcrossClass,
            Self::UnitTests => SessionPolicy::AutoResetPerTest,
        }
    }
}

/// Device form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFactor {
    /// Phone-sized screen
    #[default]
    Phone,
    /// Tablet-sized screen
    Tablet,
}

/// Restriction a test (or suite) places on the device it runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRestriction {
    /// Only run on phones
    Phone,
    /// Only run on tablets
    Tablet,
    /// Only run on low-end devices
    LowEndDevice,
    /// Never run on low-end devices
    NonLowEndDevice,
    /// Only run on automotive devices
    Auto,
    /// Never run on automotive devices
    NonAuto,
}

impl DeviceRestriction {
    /// Check whether a device satisfies this restriction
    #[must_use]
    pub const fn is_satisfied_by(self, device: &DeviceProfile) -> bool {
        match self {
            Self::Phone => matches!(device.form_factor, FormFactor::Phone),
            Self::Tablet => matches!(device.form_factor, FormFactor::Tablet),
            Self::LowEndDevice => device.low_end,
            Self::NonLowEndDevice => !device.low_end,
            Self::Auto => device.automotive,
            Self::NonAuto => !device.automotive,
        }
    }
}

impl std::fmt::Display for DeviceRestriction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Phone => "phone",
            Self::Tablet => "tablet",
            Self::LowEndDevice => "low_end_device",
            Self::NonLowEndDevice => "non_low_end_device",
            Self::Auto => "auto",
            Self::NonAuto => "non_auto",
        };
        write!(f, "{name}")
    }
}

/// Description of the device a suite runs on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Screen form factor
    #[serde(default)]
    pub form_factor: FormFactor,
    /// Low-memory / low-end device
    #[serde(default)]
    pub low_end: bool,
    /// Automotive build
    #[serde(default)]
    pub automotive: bool,
}

impl DeviceProfile {
    /// A regular phone
    #[must_use]
    pub fn phone() -> Self {
        Self::default()
    }

    /// A regular tablet
    #[must_use]
    pub fn tablet() -> Self {
        Self {
            form_factor: FormFactor::Tablet,
            ..Self::default()
        }
    }

    /// Mark as low-end
    #[must_use]
    pub const fn with_low_end(mut self, low_end: bool) -> Self {
        self.low_end = low_end;
        self
    }

    /// Mark as automotive
    #[must_use]
    pub const fn with_automotive(mut self, automotive: bool) -> Self {
        self.automotive = automotive;
        self
    }

    /// Whether every restriction holds on this device
    #[must_use]
    pub fn restrictions_satisfied(&self, restrictions: &[DeviceRestriction]) -> bool {
        self.first_unsatisfied(restrictions).is_none()
    }

    /// Return the first restriction this device does not satisfy
    #[must_use]
    pub fn first_unsatisfied(&self, restrictions: &[DeviceRestriction]) -> Option<DeviceRestriction> {
        restrictions.iter().copied().find(|r| !r.is_satisfied_by(self))
    }
}

/// Command-line switches added to or removed from the application launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLineFlags {
    /// Switches to add (`name` or `name=value`)
    #[serde(default)]
    pub add: Vec<String>,
    /// Switch names to remove
    #[serde(default)]
    pub remove: Vec<String>,
}

impl CommandLineFlags {
    /// Create an empty flag set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch
    #[must_use]
    pub fn with_add(mut self, flag: impl Into<String>) -> Self {
        self.add.push(flag.into());
        self
    }

    /// Remove a switch
    #[must_use]
    pub fn with_remove(mut self, flag: impl Into<String>) -> Self {
        self.remove.push(flag.into());
        self
    }

    /// Merge another set on top of this one (later additions win)
    pub fn merge(&mut self, other: &Self) {
        self.add.extend(other.add.iter().cloned());
        self.remove.extend(other.remove.iter().cloned());
    }

    /// Resolve to the final list of switches: removals beat additions
    #[must_use]
    pub fn resolve(&self) -> Vec<String> {
        let removed: BTreeSet<&str> = self
            .remove
            .iter()
            .map(|f| switch_name(f))
            .collect();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for flag in self.add.iter().rev() {
            let name = switch_name(flag);
            if removed.contains(name) || !seen.insert(name.to_string()) {
                continue;
            }
            out.push(flag.clone());
        }
        out.reverse();
        out
    }
}

fn switch_name(flag: &str) -> &str {
    let flag = flag.trim_start_matches('-');
    flag.split_once('=').map_or(flag, |(name, _)| name)
}

/// Feature toggles forced on or off for the launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOverrides {
    /// Features forced on
    #[serde(default)]
    pub enable: BTreeSet<String>,
    /// Features forced off
    #[serde(default)]
    pub disable: BTreeSet<String>,
}

impl FeatureOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a feature on
    #[must_use]
    pub fn with_enabled(mut self, feature: impl Into<String>) -> Self {
        let feature = feature.into();
        self.disable.remove(&feature);
        self.enable.insert(feature);
        self
    }

    /// Force a feature off
    #[must_use]
    pub fn with_disabled(mut self, feature: impl Into<String>) -> Self {
        let feature = feature.into();
        self.enable.remove(&feature);
        self.disable.insert(feature);
        self
    }

    /// Check the overrides are consistent
    pub fn validate(&self) -> EnsayoResult<()> {
        if let Some(both) = self.enable.intersection(&self.disable).next() {
            return Err(EnsayoError::config(format!(
                "feature '{both}' is both enabled and disabled"
            )));
        }
        Ok(())
    }

    /// Render as `--enable-features=` / `--disable-features=` switches
    #[must_use]
    pub fn to_switches(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.enable.is_empty() {
            let list: Vec<&str> = self.enable.iter().map(String::as_str).collect();
            out.push(format!("enable-features={}", list.join(",")));
        }
        if !self.disable.is_empty() {
            let list: Vec<&str> = self.disable.iter().map(String::as_str).collect();
            out.push(format!("disable-features={}", list.join(",")));
        }
        out
    }
}

/// Default polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollDefaults {
    /// Timeout in milliseconds
    pub timeout_ms: u64,
    /// Interval between attempts in milliseconds
    pub interval_ms: u64,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Configuration for a test suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Batch scope of the suite
    #[serde(default)]
    pub batch: BatchScope,
    /// Explicit session policy; derived from `batch` when absent
    #[serde(default)]
    pub policy: Option<SessionPolicy>,
    /// Device restrictions for every test in the suite
    #[serde(default)]
    pub restrictions: Vec<DeviceRestriction>,
    /// Command-line switches for the application launch
    #[serde(default)]
    pub command_line: CommandLineFlags,
    /// Feature overrides for the application launch
    #[serde(default)]
    pub features: FeatureOverrides,
    /// Page reused sessions are restored to
    #[serde(default = "default_baseline_url")]
    pub baseline_url: String,
    /// Polling defaults
    #[serde(default)]
    pub poll: PollDefaults,
    /// Logging verbosity
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Stop the suite after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_baseline_url() -> String {
    DEFAULT_BASELINE_URL.to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            batch: BatchScope::None,
            policy: None,
            restrictions: Vec::new(),
            command_line: CommandLineFlags::default(),
            features: FeatureOverrides::default(),
            baseline_url: default_baseline_url(),
            poll: PollDefaults::default(),
            verbosity: Verbosity::Normal,
            fail_fast: false,
        }
    }
}

impl HarnessConfig {
    /// Create new default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set batch scope
    #[must_use]
    pub const fn with_batch(mut self, batch: BatchScope) -> Self {
        self.batch = batch;
        self
    }

    /// Set session policy explicitly
    #[must_use]
    pub const fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Add a device restriction
    #[must_use]
    pub fn with_restriction(mut self, restriction: DeviceRestriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    /// Set command-line switches
    #[must_use]
    pub fn with_command_line(mut self, flags: CommandLineFlags) -> Self {
        self.command_line = flags;
        self
    }

    /// Set feature overrides
    #[must_use]
    pub fn with_features(mut self, features: FeatureOverrides) -> Self {
        self.features = features;
        self
    }

    /// Set baseline URL
    #[must_use]
    pub fn with_baseline_url(mut self, url: impl Into<String>) -> Self {
        self.baseline_url = url.into();
        self
    }

    /// Set polling defaults
    #[must_use]
    pub const fn with_poll(mut self, poll: PollDefaults) -> Self {
        self.poll = poll;
        self
    }

    /// Set verbosity
    #[must_use]
    pub const fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set fail fast
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Effective session policy
    #[must_use]
    pub fn effective_policy(&self) -> SessionPolicy {
        self.policy.unwrap_or_else(|| self.batch.default_policy())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> EnsayoResult<()> {
        if self.baseline_url.trim().is_empty() {
            return Err(EnsayoError::config("baseline_url must not be empty"));
        }
        if self.poll.interval_ms == 0 {
            return Err(EnsayoError::config("poll.interval_ms must be positive"));
        }
        if self.poll.interval_ms > self.poll.timeout_ms {
            return Err(EnsayoError::config(format!(
                "poll.interval_ms ({}) exceeds poll.timeout_ms ({})",
                self.poll.interval_ms, self.poll.timeout_ms
            )));
        }
        self.features.validate()
    }

    /// Parse and validate configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> EnsayoResult<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> EnsayoResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> EnsayoResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}
