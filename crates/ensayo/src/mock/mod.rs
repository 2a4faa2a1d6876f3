//! In-memory collaborators for exercising the harness without a real
//! application.
//!
//! ## Example
//!
//! ```
//! use ensayo::mock::{InMemoryMetrics, MockAppFactory, MockEffect};
//! use ensayo::{SessionManager, SessionPolicy};
//!
//! let metrics = InMemoryMetrics::new();
//! let factory = MockAppFactory::new()
//!     .with_metrics(metrics.clone())
//!     .on_action("open_settings", vec![
//!         MockEffect::Navigate("chrome://settings".into()),
//!         MockEffect::record("Settings.Opened", 1),
//!     ]);
//!
//! let manager = SessionManager::new(factory);
//! let session = manager.acquire(SessionPolicy::FreshPerTest).unwrap();
//! session.issue_action("open_settings").unwrap();
//! assert_eq!(metrics.total_count("Settings.Opened"), 1);
//! ```

pub mod app;
pub mod metrics;
pub mod strategies;

pub use app::{recorded_samples, MockApp, MockAppFactory, MockEffect, MockStats, NEW_TAB_URL};
pub use metrics::InMemoryMetrics;
#[cfg(feature = "proptest")]
pub use strategies::{any_end_state, any_intent, intent_batch};
pub use strategies::{standard_end_states, standard_intents};
