//! Request construction: parameter catalog, layered composition and
//! serialization to the wire format.

pub mod catalog;
pub mod composer;
pub mod set;
pub mod tracking;

pub use catalog::{Category, Param};
pub use composer::{Composer, EventKind, Facts, REQUEST_STORE_SIZE_FACT};
pub use set::ParameterSet;
pub use tracking::{RequestKind, TrackingRequest, LIBRARY_VERSION};
