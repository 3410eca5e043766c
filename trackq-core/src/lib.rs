//! # trackq-core
//!
//! On-device core of an analytics tracking library: it turns tracking calls
//! into request URLs, keeps them in a crash-safe queue and delivers them to
//! the collector in the background.
//!
//! This library provides:
//! - Parameter composition and request serialization ([`request`])
//! - A durable FIFO queue with a bounded in-memory cache ([`queue`])
//! - A staging store for requests waiting on attribution ([`staging`])
//! - Background delivery with retry classification ([`delivery`])
//! - The [`Tracker`] session handle tying it all together
//! - Configuration, preferences (SQLite) and logging
//!
//! ## Example
//!
//! ```rust,no_run
//! use trackq_core::{Config, ParameterSet, Tracker};
//!
//! let config = Config::load().expect("failed to load config");
//! let tracker = Tracker::open(&config).expect("failed to open tracker");
//!
//! tracker.track_page("Home", ParameterSet::new());
//! tracker.teardown();
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, DeliveryConfig, StorageConfig, TrackingConfig};
pub use delivery::{Deliver, DeliveryScheduler, DeliveryStatsSnapshot, Outcome};
pub use error::{Error, Result};
pub use prefs::Preferences;
pub use queue::{DurableQueue, QueueEntry};
pub use request::{Category, Facts, Param, ParameterSet, RequestKind, TrackingRequest};
pub use staging::{StagedRequest, StagingStore};
pub use tracker::Tracker;

// Public modules
pub mod config;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod prefs;
pub mod queue;
pub mod request;
pub mod staging;
pub mod tracker;
