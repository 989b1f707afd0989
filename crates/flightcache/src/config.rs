//! Cache configuration

use std::time::Duration;
use serde::Deserialize;

/// Default bound on how long a caller waits for a key lock (5 minutes)
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Where per-key lock handles are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Dedicated map, separate from cached data
    #[default]
    Keyed,
    /// Inside the data store under `locker@<key>`
    Store,
}

/// Tunables for a `CacheManager`
///
/// Durations are written in humantime form (`"50ms"`, `"5m"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound on waiting for another caller's load of the same key
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Lock registry backing the manager
    pub registry: RegistryKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            registry: RegistryKind::default(),
        }
    }
}
