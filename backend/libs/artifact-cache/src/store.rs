//! Storage backends
//!
//! - `FsArtifactStore`: one file per key, written through a temp file + rename
//! - `RedisArtifactStore`: binary values under the same key schema
//! - `MemoryArtifactStore`: process-local, for tests and single-shot jobs

use crate::error::CacheResult;
use dashmap::DashMap;
use redis::Commands;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Raw byte storage keyed by `ArtifactKey::storage_key()`
pub trait ArtifactStore: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()>;

    fn remove(&self, key: &str) -> CacheResult<()>;

    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;
}

// ============= Filesystem =============

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.bin", file_name))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), bytes = bytes.len(), "Artifact written");
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend(&self) -> &'static str {
        "fs"
    }
}

// ============= Redis =============

pub struct RedisArtifactStore {
    client: redis::Client,
    /// Optional retention for old epochs; entries never change while alive
    retention_secs: Option<u64>,
}

impl RedisArtifactStore {
    pub fn new(redis_url: &str) -> CacheResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            retention_secs: None,
        })
    }

    pub fn with_retention(mut self, secs: u64) -> Self {
        self.retention_secs = Some(secs);
        self
    }
}

impl ArtifactStore for RedisArtifactStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.client.get_connection()?;
        let value: Option<Vec<u8>> = conn.get(key)?;
        Ok(value)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        let mut conn = self.client.get_connection()?;
        match self.retention_secs {
            Some(secs) => conn.set_ex::<_, _, ()>(key, bytes, secs)?,
            None => conn.set::<_, _, ()>(key, bytes)?,
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.client.get_connection()?;
        conn.del::<_, ()>(key)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

// ============= Memory =============

#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        assert!(store.get("v1:e1:matrix").unwrap().is_none());
        store.put("v1:e1:matrix", b"payload").unwrap();
        assert_eq!(store.get("v1:e1:matrix").unwrap().unwrap(), b"payload");

        store.remove("v1:e1:matrix").unwrap();
        assert!(store.get("v1:e1:matrix").unwrap().is_none());
        // Removing twice is not an error
        store.remove("v1:e1:matrix").unwrap();
    }

    #[test]
    fn test_fs_store_sanitizes_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        let path = store.path_for("v1:../../etc:passwd");
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        store.put("k", &[1, 2]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").unwrap().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_redis_store_roundtrip() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store = match RedisArtifactStore::new(&redis_url) {
            Ok(store) => store.with_retention(60),
            Err(_) => return,
        };
        // Skip when no server is reachable
        if store.client.get_connection().is_err() {
            println!("Redis not available, skipping test");
            return;
        }

        store.put("v1:test-epoch:sample", b"abc").unwrap();
        assert_eq!(store.get("v1:test-epoch:sample").unwrap().unwrap(), b"abc");
        store.remove("v1:test-epoch:sample").unwrap();
    }
}
