//! # flightcache
//!
//! Get-or-load cache layer for FlightStore.
//!
//! ## Architecture
//! - **Store**: any [`CacheStore`]; values expire by ttl, nothing else evicts
//! - **Locks**: one [`LockHandle`] per key from a [`LockRegistry`], so concurrent
//!   misses run a single loader
//! - **Timeouts**: waiters give up after the lock timeout and drop the lock they
//!   waited on, so an abandoned load cannot wedge its key
//!
//! ```
//! use std::time::Duration;
//! use flightcache::CacheManager;
//!
//! let cache = CacheManager::with_defaults();
//! let value = cache.get_or_compute("answer", || 42u32, Duration::from_secs(60));
//! assert_eq!(value.as_deref(), Some(&42));
//! ```

#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod lock;
mod outcome;
mod stats;

pub use cache::{CacheManager, Validator};
pub use config::{CacheConfig, RegistryKind, DEFAULT_LOCK_TIMEOUT};
pub use error::{BoxError, LoadError};
pub use flightstore::{CacheStore, Clock, ManualClock, MemoryStore, SystemClock, Value};
pub use lock::{lock_key, KeyedLocks, LockHandle, LockRegistry, StoreLocks, LOCK_KEY_PREFIX};
pub use outcome::Outcome;
pub use stats::CacheStats;
