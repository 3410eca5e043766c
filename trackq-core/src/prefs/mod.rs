//! Preferences store for trackq
//!
//! Small key/value state that must survive restarts:
//! - the durable queue cursor (length and head offset)
//! - opt-out flag
//! - sampling decision and the rate it was computed for
//! - EverID and the first-start marker

pub mod schema;
pub mod store;

pub use store::{Preferences, QueueCursor, SamplingDecision};
