//! Delivery of queued requests to the collector.
//!
//! - [`worker`]: one GET per payload, classified into an [`Outcome`]
//! - [`scheduler`]: background timers and the single-flight drain slot

pub mod scheduler;
pub mod worker;

pub use scheduler::{ActivityClock, DeliveryScheduler, SchedulerConfig};
pub use worker::{
    deliver_all_blocking, drain, Deliver, DeliveryStats, DeliveryStatsSnapshot, DrainReport,
    HttpDeliveryWorker, Outcome,
};
