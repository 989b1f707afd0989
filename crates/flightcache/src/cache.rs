//! CacheManager: get-or-load with one loader per key at a time

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use flightstore::{expiry_after, CacheStore, MemoryStore};
use tracing::{debug, warn};

use crate::config::{CacheConfig, RegistryKind};
use crate::error::{BoxError, LoadError};
use crate::lock::{lock_key, KeyedLocks, LockHandle, LockRegistry, StoreLocks};
use crate::outcome::Outcome;
use crate::stats::CacheStats;

/// Predicate deciding whether a freshly loaded value may be cached
pub type Validator = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Get-or-load cache over a [`CacheStore`]
///
/// Concurrent `load` calls for the same key share one lock handle; the
/// caller that holds it runs the loader while the others wait up to the
/// lock timeout and then read what it stored.
pub struct CacheManager {
    /// Backing store for cached values
    store: Arc<dyn CacheStore>,

    /// Per-key lock handles
    locks: Arc<dyn LockRegistry>,

    /// Bound on waiting for a key lock
    lock_timeout: Duration,

    /// Registry kind the manager was configured with
    registry: RegistryKind,

    /// Gate applied to loaded values before caching
    validator: Validator,

    /// Cache statistics
    stats: Arc<CacheStats>,
}

impl CacheManager {
    /// Create a manager over `store` with default configuration
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Create a manager over `store`
    ///
    /// # Arguments
    /// * `store` - Backing store, shared with whoever else holds it
    /// * `config` - Lock timeout and lock registry choice
    pub fn with_config(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        let locks: Arc<dyn LockRegistry> = match config.registry {
            RegistryKind::Keyed => Arc::new(KeyedLocks::new()),
            RegistryKind::Store => Arc::new(StoreLocks::new(Arc::clone(&store))),
        };

        Self {
            store,
            locks,
            lock_timeout: config.lock_timeout,
            registry: config.registry,
            validator: Arc::new(|_| true),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Create a manager over a fresh [`MemoryStore`]
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Replace the validator; values it rejects are returned but not cached
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&dyn Any) -> bool + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    /// Replace the lock registry
    ///
    /// The configured [`RegistryKind`] reported by [`config`](Self::config) is left as is.
    pub fn with_lock_registry(mut self, locks: Arc<dyn LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Bound on waiting for another caller's load of the same key
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Change the lock wait bound
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    /// Current configuration
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            lock_timeout: self.lock_timeout,
            registry: self.registry,
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get a cached value
    ///
    /// # Returns
    /// * `Option<Arc<T>>` - `None` on a miss and when the cached value is not a `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.lookup(key);
        if value.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        value
    }

    /// Check if a live value of any type is cached under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.store.get(key).is_some()
    }

    /// Get a cached value, running `loader` to produce it on a miss
    ///
    /// A value already cached is returned without touching the key lock.
    /// At most one loader per key runs at a time. Callers that wait longer
    /// than the lock timeout get `Absent` and drop the lock they waited on
    /// from the registry, so a load that never finishes cannot block the key
    /// forever. The timed out load is not interrupted and still stores its
    /// result when it completes.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `loader` - Produces the value; errors and panics become `LoadFailed`
    /// * `ttl` - Lifetime of the cached value
    ///
    /// # Returns
    /// * `Outcome<T>` - Found value, absent, or the loader's failure
    pub fn load<T, E, F>(&self, key: &str, loader: F, ttl: Duration) -> Outcome<T>
    where
        T: Any + Send + Sync,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.lookup(key) {
            self.stats.record_hit();
            return Outcome::Found(value);
        }

        let handle = self.locks.get_or_create(key, ttl);
        let outcome = match handle.try_acquire_for(self.lock_timeout) {
            Some(guard) => {
                let outcome = self.load_locked(key, loader, ttl);
                drop(guard);
                outcome
            }
            None => {
                self.heal(key, &handle);
                Outcome::Absent
            }
        };
        self.locks.release(key, handle);

        outcome
    }

    /// [`load`](Self::load) collapsed to an optional value
    pub fn get_or_load<T, E, F>(&self, key: &str, loader: F, ttl: Duration) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.load(key, loader, ttl).into_option()
    }

    /// [`get_or_load`](Self::get_or_load) for loaders that cannot fail
    pub fn get_or_compute<T, F>(&self, key: &str, compute: F, ttl: Duration) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.get_or_load(key, || Ok::<T, Infallible>(compute()), ttl)
    }

    /// Store a value for `ttl`, overwriting any previous one
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T, ttl: Duration) {
        self.set_shared(key, Arc::new(value), ttl);
    }

    /// Remove a cached value
    pub fn remove(&self, key: &str) {
        self.store.remove(key);
    }

    /// Remove every key present in the store, then reclaim expired entries
    pub fn clear(&self) {
        // Snapshot first; keys are removed one by one afterwards
        let keys = self.store.keys();
        for key in &keys {
            self.store.remove(key);
        }
        let purged = self.store.purge_expired();
        debug!(removed = keys.len(), purged, "cache cleared");
    }

    fn lookup<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.store.get(key)?.downcast::<T>().ok()
    }

    fn set_shared<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>, ttl: Duration) {
        let expires_at = expiry_after(self.store.now(), ttl);
        self.store.set(key, value, expires_at);
    }

    fn load_locked<T, E, F>(&self, key: &str, loader: F, ttl: Duration) -> Outcome<T>
    where
        T: Any + Send + Sync,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E>,
    {
        // Another holder may have filled the key while we waited
        if let Some(value) = self.lookup(key) {
            self.stats.record_hit();
            return Outcome::Found(value);
        }
        self.stats.record_miss();

        debug!(key, "loading value");
        let loaded = match panic::catch_unwind(AssertUnwindSafe(loader)) {
            Ok(Ok(value)) => Arc::new(value),
            Ok(Err(e)) => return self.load_failed(key, LoadError::Failed(e.into())),
            Err(payload) => return self.load_failed(key, LoadError::from_panic(payload)),
        };
        self.stats.record_load();

        if (self.validator)(&*loaded) {
            self.set_shared(key, Arc::clone(&loaded), ttl);
            debug!(key, ?ttl, "cached loaded value");
        } else {
            self.stats.record_rejection();
            debug!(key, "validator rejected loaded value, not caching");
        }

        Outcome::Found(loaded)
    }

    fn load_failed<T>(&self, key: &str, error: LoadError) -> Outcome<T> {
        self.stats.record_load_failure();
        warn!(key, %error, "loader produced no value");
        Outcome::LoadFailed(error)
    }

    fn heal(&self, key: &str, handle: &LockHandle) {
        self.stats.record_miss();
        self.stats.record_lock_timeout();
        if self.locks.remove_if_same(key, handle) {
            self.stats.record_self_heal();
            warn!(
                key,
                lock_key = %lock_key(key),
                timeout = ?self.lock_timeout,
                "timed out waiting for key lock, dropped it as abandoned"
            );
        } else {
            warn!(key, timeout = ?self.lock_timeout, "timed out waiting for key lock");
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("lock_timeout", &self.lock_timeout)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
