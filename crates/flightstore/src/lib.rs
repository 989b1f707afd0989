//! # flightstore
//!
//! Expiring key-value store used underneath FlightCache.
//!
//! ## Contract
//! - Values are opaque, type-erased and shared (`Arc<dyn Any + Send + Sync>`)
//! - Every entry carries an absolute expiration instant
//! - Basic operations: GET, SET, REMOVE, KEYS
//! - Time comes from a pluggable [`Clock`] so expiration is testable

#![warn(missing_docs)]

mod clock;
mod store;

pub use clock::{expiry_after, Clock, ManualClock, SystemClock};
pub use store::{CacheStore, MemoryStore, Value};
