//! Epoch-versioned artifact cache
//!
//! Persists the expensive products of an epoch build (interaction matrix,
//! factor matrices, neighbour tables, per-user aggregates) so each is computed
//! once per data epoch:
//! - Keys are scoped by epoch id and schema version (see [`keys`])
//! - Every entry is framed with a SHA-256 checksum (see [`envelope`])
//! - A corrupt, foreign or schema-mismatched entry is a miss, never an error
//! - A backend read failure is a miss as well; a write failure is logged and
//!   the freshly built value is still returned
//!
//! Entries are immutable: a new epoch writes a fresh, independent set.

mod error;
mod keys;

pub mod envelope;
pub mod store;

pub use error::{CacheError, CacheResult};
pub use keys::{ArtifactKey, SCHEMA_VERSION};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, RedisArtifactStore};

use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hit/miss counters since process start
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Entries found but discarded by the integrity check
    pub rejected: u64,
    pub write_failures: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
    stats: Arc<CacheStats>,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryArtifactStore::new()))
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Look up a trusted entry. Anything that fails to decode or verify is
    /// reported as `None`.
    pub fn lookup<T: DeserializeOwned>(&self, key: &ArtifactKey) -> Option<T> {
        let storage_key = key.storage_key();

        let bytes = match self.store.get(&storage_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key = %storage_key, "Artifact cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Artifact store read failed, treating as miss");
                return None;
            }
        };

        let payload = match envelope::open(key, &bytes) {
            Ok((payload, _info)) => payload,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Discarding untrusted artifact entry");
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match bincode::deserialize::<T>(&payload) {
            Ok(value) => {
                debug!(key = %storage_key, bytes = payload.len(), "Artifact cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Artifact payload does not match expected layout");
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Persist a value. Failures are returned to the caller; `load_or_build`
    /// only logs them.
    pub fn store<T: Serialize>(&self, key: &ArtifactKey, value: &T) -> CacheResult<()> {
        let payload = bincode::serialize(value)?;
        let sealed = envelope::seal(key, payload)?;
        self.store.put(&key.storage_key(), &sealed)
    }

    /// Return the cached artifact for `key`, or run `builder`, persist its
    /// output and return it.
    pub fn load_or_build<T, E, F>(&self, key: &ArtifactKey, builder: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.lookup::<T>(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let started = std::time::Instant::now();
        let value = builder()?;
        info!(
            key = %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Artifact built"
        );

        if let Err(e) = self.store(key, &value) {
            self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "Failed to persist artifact");
        }

        Ok(value)
    }

    /// Drop one entry (used when a caller detects a semantically bad artifact)
    pub fn evict(&self, key: &ArtifactKey) -> CacheResult<()> {
        self.store.remove(&key.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Neighbours {
        lists: Vec<(String, Vec<(String, f64)>)>,
    }

    fn sample() -> Neighbours {
        Neighbours {
            lists: vec![("i1".into(), vec![("i3".into(), 0.8), ("i4".into(), 0.5)])],
        }
    }

    #[test]
    fn test_hit_skips_builder() {
        let cache = ArtifactCache::in_memory();
        let key = ArtifactKey::new("e1", "item_neighbors");
        let calls = Cell::new(0);

        let first: Neighbours = cache
            .load_or_build(&key, || {
                calls.set(calls.get() + 1);
                Ok::<_, String>(sample())
            })
            .unwrap();
        let second: Neighbours = cache
            .load_or_build(&key, || {
                calls.set(calls.get() + 1);
                Ok::<_, String>(sample())
            })
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_corrupt_entry_is_rebuilt() {
        let store = Arc::new(MemoryArtifactStore::new());
        let cache = ArtifactCache::new(store.clone());
        let key = ArtifactKey::new("e1", "item_neighbors");

        store.put(&key.storage_key(), b"garbage bytes").unwrap();

        let value: Neighbours = cache
            .load_or_build(&key, || Ok::<_, String>(sample()))
            .unwrap();
        assert_eq!(value, sample());
        assert_eq!(cache.stats().rejected, 1);

        // The rebuilt value replaced the corrupt entry
        assert_eq!(cache.lookup::<Neighbours>(&key), Some(sample()));
    }

    #[test]
    fn test_layout_mismatch_is_miss() {
        let cache = ArtifactCache::in_memory();
        let key = ArtifactKey::new("e1", "user_cf");
        cache.store(&key, &vec![1u8, 2, 3]).unwrap();

        assert!(cache.lookup::<Neighbours>(&key).is_none());
    }

    #[test]
    fn test_builder_error_propagates_and_nothing_is_written() {
        let store = Arc::new(MemoryArtifactStore::new());
        let cache = ArtifactCache::new(store.clone());
        let key = ArtifactKey::new("e1", "latent_factors");

        let result: Result<Neighbours, String> =
            cache.load_or_build(&key, || Err("rank too low".to_string()));

        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_fs_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = ArtifactKey::new("e7", "catalog");

        let cache = ArtifactCache::new(Arc::new(FsArtifactStore::new(dir.path()).unwrap()));
        cache.store(&key, &sample()).unwrap();

        let reopened = ArtifactCache::new(Arc::new(FsArtifactStore::new(dir.path()).unwrap()));
        assert_eq!(reopened.lookup::<Neighbours>(&key), Some(sample()));
        assert!(reopened
            .lookup::<Neighbours>(&ArtifactKey::new("e8", "catalog"))
            .is_none());
    }
}
