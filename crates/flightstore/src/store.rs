//! Store contract and the default in-memory implementation
//!
//! Layout:
//! - one hash map from key to `(value, expires_at)`
//! - expired entries read as absent; writes sweep them out at most once per
//!   `SWEEP_INTERVAL` of store time, `purge_expired` sweeps on demand

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ahash::RandomState;
use parking_lot::{Mutex, RwLock};

use crate::clock::{expiry_after, Clock, SystemClock};

/// Minimum store time between two sweeps triggered by writes
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Type-erased payload held by a store
pub type Value = Arc<dyn Any + Send + Sync>;

/// Keyed container of expiring, type-erased values
///
/// Implementations must be safe to share between threads. `keys` must
/// return a snapshot so callers can remove entries while walking it.
pub trait CacheStore: Send + Sync {
    /// Look up a live entry
    fn get(&self, key: &str) -> Option<Value>;

    /// Insert or overwrite an entry that expires at `expires_at`
    fn set(&self, key: &str, value: Value, expires_at: Instant);

    /// Remove an entry, returning the previous value if it was live
    fn remove(&self, key: &str) -> Option<Value>;

    /// Snapshot of keys currently present
    fn keys(&self) -> Vec<String>;

    /// Reclaim entries that have expired, returning how many were dropped
    ///
    /// Stores that expire entries on their own may keep the default.
    fn purge_expired(&self) -> usize {
        0
    }

    /// The store's notion of the current instant
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory expiring store
pub struct MemoryStore {
    /// Entries by key
    entries: RwLock<HashMap<String, Entry, RandomState>>,

    /// Time source used for expiration checks
    clock: Arc<dyn Clock>,

    /// Earliest instant at which a write sweeps expired entries
    next_sweep: Mutex<Instant>,
}

impl MemoryStore {
    /// Create an empty store driven by the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store driven by the given clock
    ///
    /// # Arguments
    /// * `clock` - Time source; pass a `ManualClock` to control expiration in tests
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            entries: RwLock::new(HashMap::with_hasher(RandomState::new())),
            clock,
            next_sweep: Mutex::new(now),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Check if the store holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries held, including expired ones not yet reclaimed
    pub fn stored_len(&self) -> usize {
        self.entries.read().len()
    }

    fn sweep(entries: &mut HashMap<String, Entry, RandomState>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(Arc::clone(&entry.value)),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it unless someone rewrote it in the meantime
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: Value, expires_at: Instant) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        entries.insert(key.to_owned(), Entry { value, expires_at });

        let mut next_sweep = self.next_sweep.lock();
        if now >= *next_sweep {
            Self::sweep(&mut entries, now);
            *next_sweep = expiry_after(now, SWEEP_INTERVAL);
        }
    }

    fn remove(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        entries
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value)
    }

    fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every expired entry
    ///
    /// # Returns
    /// * `usize` - Number of entries dropped
    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        Self::sweep(&mut entries, now)
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{expiry_after, ManualClock};
    use std::time::Duration;

    fn manual_store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    fn put(store: &MemoryStore, key: &str, value: &'static str, ttl: Duration) {
        store.set(key, Arc::new(value), expiry_after(store.now(), ttl));
    }

    fn read(store: &MemoryStore, key: &str) -> Option<&'static str> {
        store
            .get(key)
            .and_then(|value| value.downcast_ref::<&'static str>().copied())
    }

    #[test]
    fn test_set_and_get() {
        let store = MemoryStore::new();
        put(&store, "a", "alpha", Duration::from_secs(60));

        assert_eq!(read(&store, "a"), Some("alpha"));
        assert_eq!(read(&store, "b"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let store = MemoryStore::new();
        put(&store, "a", "first", Duration::from_secs(60));
        put(&store, "a", "second", Duration::from_secs(60));

        assert_eq!(read(&store, "a"), Some("second"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_entry_expires() {
        let (clock, store) = manual_store();
        put(&store, "a", "alpha", Duration::from_secs(5));

        clock.advance(Duration::from_millis(4999));
        assert_eq!(read(&store, "a"), Some("alpha"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(read(&store, "a"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_ttl_is_absent() {
        let (_clock, store) = manual_store();
        put(&store, "a", "alpha", Duration::ZERO);
        assert_eq!(read(&store, "a"), None);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        put(&store, "a", "alpha", Duration::from_secs(60));
        put(&store, "b", "beta", Duration::from_secs(60));

        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(read(&store, "a"), None);
        assert_eq!(read(&store, "b"), Some("beta"));
    }

    #[test]
    fn test_keys_skip_expired() {
        let (clock, store) = manual_store();
        put(&store, "short", "s", Duration::from_secs(1));
        put(&store, "long", "l", Duration::from_secs(10));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["long".to_string(), "short".to_string()]);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.keys(), vec!["long".to_string()]);
    }

    #[test]
    fn test_purge_expired() {
        let (clock, store) = manual_store();
        put(&store, "a", "alpha", Duration::from_secs(1));
        put(&store, "b", "beta", Duration::from_secs(1));
        put(&store, "c", "gamma", Duration::from_secs(10));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_writes_reclaim_expired_entries() {
        let (clock, store) = manual_store();
        for i in 0..100 {
            put(&store, &format!("old:{i}"), "old", Duration::from_secs(1));
        }
        assert_eq!(store.stored_len(), 100);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.stored_len(), 100, "nothing reclaimed until a write");

        put(&store, "new", "new", Duration::from_secs(60));
        assert_eq!(store.stored_len(), 1);
        assert_eq!(read(&store, "new"), Some("new"));
    }

    #[test]
    fn test_write_sweeps_are_rate_limited() {
        let (clock, store) = manual_store();
        put(&store, "first", "f", Duration::from_secs(60));
        put(&store, "short", "s", Duration::from_millis(100));

        clock.advance(Duration::from_millis(200));
        put(&store, "other", "o", Duration::from_secs(60));
        assert_eq!(store.stored_len(), 3, "within the sweep interval");

        clock.advance(Duration::from_secs(1));
        put(&store, "later", "l", Duration::from_secs(60));
        assert_eq!(store.stored_len(), 3);
        assert_eq!(read(&store, "short"), None);
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let key = format!("{t}:{i}");
                        store.set(&key, Arc::new(i), expiry_after(store.now(), Duration::from_secs(60)));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 1000);
        assert_eq!(store.keys().len(), 1000);
    }
}
