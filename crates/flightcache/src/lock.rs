//! Per-key lock handles and the registries that hand them out
//!
//! Every caller loading the same key must end up with the same handle, so
//! handle creation goes through a single creation mutex. The mutex only
//! covers the lookup-or-create step, never the load itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use ahash::RandomState;
use flightstore::{expiry_after, CacheStore};
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

/// Prefix of the reserved key a lock is registered under
pub const LOCK_KEY_PREFIX: &str = "locker@";

/// Reserved key for the lock guarding `key`
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{key}")
}

/// Shared binary lock; clones refer to the same lock
#[derive(Clone, Default)]
pub struct LockHandle {
    inner: Arc<Mutex<()>>,
}

impl LockHandle {
    /// Create a fresh, unheld lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive ownership
    ///
    /// # Returns
    /// * `Some(guard)` - Lock held until the guard drops
    /// * `None` - Timed out
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.inner.try_lock_for(timeout)
    }

    /// True when both handles refer to the same lock
    pub fn same_as(&self, other: &LockHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Check if some caller currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    fn owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &Arc::as_ptr(&self.inner))
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Hands out one lock handle per cache key
pub trait LockRegistry: Send + Sync {
    /// Registered handle for `key`, creating and registering one if needed
    ///
    /// `ttl` bounds how long a newly registered handle may stay registered,
    /// for registries that expire handles by time.
    fn get_or_create(&self, key: &str, ttl: Duration) -> LockHandle;

    /// Unregister the handle for `key` only if it is `handle`
    ///
    /// Check and removal happen atomically with respect to `get_or_create`.
    fn remove_if_same(&self, key: &str, handle: &LockHandle) -> bool;

    /// Give back a handle once the caller is done with it
    fn release(&self, key: &str, handle: LockHandle) {
        let _ = (key, handle);
    }
}

/// Registry keeping handles in a dedicated map
///
/// Entries are dropped as soon as the last caller using them releases, so
/// the map only holds keys with a load in progress or callers waiting.
#[derive(Default)]
pub struct KeyedLocks {
    handles: Mutex<HashMap<String, LockHandle, RandomState>>,
}

impl KeyedLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Check if no handle is registered
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl LockRegistry for KeyedLocks {
    fn get_or_create(&self, key: &str, _ttl: Duration) -> LockHandle {
        let mut handles = self.handles.lock();
        handles.entry(key.to_owned()).or_default().clone()
    }

    fn remove_if_same(&self, key: &str, handle: &LockHandle) -> bool {
        let mut handles = self.handles.lock();
        if handles.get(key).is_some_and(|current| current.same_as(handle)) {
            handles.remove(key);
            true
        } else {
            false
        }
    }

    fn release(&self, key: &str, handle: LockHandle) {
        let mut handles = self.handles.lock();
        // Registry plus the releasing caller: nobody else can be waiting on it
        let unused = handles
            .get(key)
            .is_some_and(|current| current.same_as(&handle) && current.owners() <= 2);
        if unused {
            handles.remove(key);
        }
        // Let go of our reference while other releasers are still excluded
        drop(handle);
    }
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("handles", &self.len())
            .finish()
    }
}

/// Registry keeping handles in the data store under [`lock_key`]
///
/// Handles expire with the ttl they were created with, like any other
/// entry. A foreign value sitting at a lock key makes this registry hand
/// out unregistered handles for that key.
pub struct StoreLocks {
    store: Arc<dyn CacheStore>,
    creation: Mutex<()>,
}

impl StoreLocks {
    /// Create a registry over `store`
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            creation: Mutex::new(()),
        }
    }

    fn registered(&self, lock_key: &str) -> Result<Option<LockHandle>, ()> {
        match self.store.get(lock_key) {
            Some(value) => match value.downcast_ref::<LockHandle>() {
                Some(handle) => Ok(Some(handle.clone())),
                None => Err(()),
            },
            None => Ok(None),
        }
    }
}

impl LockRegistry for StoreLocks {
    fn get_or_create(&self, key: &str, ttl: Duration) -> LockHandle {
        let reserved = lock_key(key);
        let _creation = self.creation.lock();

        match self.registered(&reserved) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                let handle = LockHandle::new();
                let expires_at = expiry_after(self.store.now(), ttl);
                self.store.set(&reserved, Arc::new(handle.clone()), expires_at);
                handle
            }
            Err(()) => {
                warn!(key, lock_key = %reserved, "lock key holds a foreign value; using an unregistered lock");
                LockHandle::new()
            }
        }
    }

    fn remove_if_same(&self, key: &str, handle: &LockHandle) -> bool {
        let reserved = lock_key(key);
        let _creation = self.creation.lock();

        match self.registered(&reserved) {
            Ok(Some(current)) if current.same_as(handle) => {
                self.store.remove(&reserved);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for StoreLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLocks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flightstore::{ManualClock, MemoryStore};
    use std::sync::Barrier;
    use std::thread;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("user:1"), "locker@user:1");
    }

    #[test]
    fn test_handle_is_exclusive() {
        let handle = LockHandle::new();
        let other = handle.clone();

        let guard = handle.try_acquire_for(Duration::from_millis(10));
        assert!(guard.is_some());
        assert!(other.is_locked());
        assert!(other.try_acquire_for(Duration::from_millis(20)).is_none());

        drop(guard);
        assert!(other.try_acquire_for(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_handle_identity() {
        let a = LockHandle::new();
        let b = LockHandle::new();

        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_keyed_same_key_same_handle() {
        let locks = KeyedLocks::new();

        let a = locks.get_or_create("k", TTL);
        let b = locks.get_or_create("k", TTL);
        let c = locks.get_or_create("other", TTL);

        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_keyed_concurrent_creation_is_unique() {
        let locks = Arc::new(KeyedLocks::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.get_or_create("k", TTL)
                })
            })
            .collect();

        let created: Vec<LockHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(created.iter().all(|h| h.same_as(&created[0])));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_keyed_remove_if_same() {
        let locks = KeyedLocks::new();
        let stale = locks.get_or_create("k", TTL);

        assert!(!locks.remove_if_same("k", &LockHandle::new()));
        assert!(locks.remove_if_same("k", &stale));
        assert!(locks.is_empty());

        // A replacement must not be removed on behalf of the stale handle
        let fresh = locks.get_or_create("k", TTL);
        assert!(!fresh.same_as(&stale));
        assert!(!locks.remove_if_same("k", &stale));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_keyed_release_reclaims_unused() {
        let locks = KeyedLocks::new();

        let first = locks.get_or_create("k", TTL);
        let waiter = locks.get_or_create("k", TTL);

        locks.release("k", first);
        assert_eq!(locks.len(), 1, "waiter still references the handle");

        locks.release("k", waiter);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_store_locks_registered_under_lock_key() {
        let store = Arc::new(MemoryStore::new());
        let locks = StoreLocks::new(store.clone());

        let a = locks.get_or_create("k", TTL);
        let b = locks.get_or_create("k", TTL);
        assert!(a.same_as(&b));

        let stored = store.get("locker@k").unwrap();
        assert!(stored.downcast_ref::<LockHandle>().unwrap().same_as(&a));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_store_locks_expire_with_ttl() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let locks = StoreLocks::new(store);

        let before = locks.get_or_create("k", Duration::from_secs(5));
        clock.advance(Duration::from_secs(5));
        let after = locks.get_or_create("k", Duration::from_secs(5));

        assert!(!before.same_as(&after));
    }

    #[test]
    fn test_store_locks_foreign_value_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.set("locker@k", Arc::new("not a lock"), expiry_after(store.now(), TTL));
        let locks = StoreLocks::new(store.clone());

        let a = locks.get_or_create("k", TTL);
        let b = locks.get_or_create("k", TTL);

        assert!(!a.same_as(&b));
        assert!(!locks.remove_if_same("k", &a));
        let kept = store.get("locker@k").unwrap();
        assert_eq!(kept.downcast_ref::<&str>(), Some(&"not a lock"));
    }

    #[test]
    fn test_store_locks_remove_if_same() {
        let store = Arc::new(MemoryStore::new());
        let locks = StoreLocks::new(store.clone());

        let handle = locks.get_or_create("k", TTL);
        assert!(!locks.remove_if_same("k", &LockHandle::new()));
        assert!(locks.remove_if_same("k", &handle));
        assert!(store.get("locker@k").is_none());
    }
}
