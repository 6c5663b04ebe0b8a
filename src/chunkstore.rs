//! Content-addressed blob store with a byte budget (§4.2).
//!
//! Two implementations share one [`ChunkStore`] trait: an in-memory store for
//! tests and benchmarks, and a `tokio::fs`-backed on-disk store for the
//! running daemon. Both shard chunks by class (hashable vs. opaque) and by
//! purpose (normal / cache / outgoing) the way the on-disk layout in §6.2
//! describes, so the orchestrator never needs to know which backend it holds.

use crate::id::ChunkName;
use async_trait::async_trait;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkStoreError {
    #[error("chunk {0} not found")]
    NotFound(ChunkName),
    #[error("SHA-512(bytes) does not match chunk name {0}")]
    HashMismatch(ChunkName),
    #[error("storage full: {requested} bytes requested, {available} available")]
    StorageFull { requested: u64, available: u64 },
    #[error("io error: {0}")]
    Io(String),
}

/// Whether a chunk's name must equal the SHA-512 of its bytes. Self-encrypted
/// file chunks are hashable; cache copies fetched on a client's behalf are
/// not always re-verified by the holder and are stored as opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hashability {
    Hashable,
    Opaque,
}

/// Purpose shard a chunk lives under, mirrored on disk as a subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shard {
    Normal,
    Cache,
    Outgoing,
}

impl Shard {
    fn dirname(self) -> &'static str {
        match self {
            Shard::Normal => "normal",
            Shard::Cache => "cache",
            Shard::Outgoing => "outgoing",
        }
    }
}

impl Hashability {
    fn dirname(self) -> &'static str {
        match self {
            Hashability::Hashable => "hashable",
            Hashability::Opaque => "opaque",
        }
    }
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn has(&self, name: &ChunkName) -> bool;
    async fn store(
        &self,
        name: &ChunkName,
        bytes: Vec<u8>,
        hashability: Hashability,
        shard: Shard,
    ) -> Result<(), ChunkStoreError>;
    async fn load(&self, name: &ChunkName) -> Result<Vec<u8>, ChunkStoreError>;
    async fn delete(&self, name: &ChunkName) -> Result<(), ChunkStoreError>;
    async fn size(&self, name: &ChunkName) -> Result<u64, ChunkStoreError>;
    async fn available(&self) -> u64;
    async fn used(&self) -> u64;
}

fn verify_hash(name: &ChunkName, bytes: &[u8]) -> Result<(), ChunkStoreError> {
    let digest = Sha512::digest(bytes);
    if digest.as_slice() != name.as_bytes() {
        return Err(ChunkStoreError::HashMismatch(*name));
    }
    Ok(())
}

struct Entry {
    bytes: Vec<u8>,
    shard: Shard,
}

/// In-memory chunk store, used by tests and by the watch-list/amendment
/// benchmarks that don't want filesystem latency in the critical path.
pub struct MemoryChunkStore {
    entries: Mutex<HashMap<ChunkName, Entry>>,
    budget: u64,
    used: AtomicU64,
}

impl MemoryChunkStore {
    pub fn new(budget: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget,
            used: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn has(&self, name: &ChunkName) -> bool {
        self.entries.lock().await.contains_key(name)
    }

    async fn store(
        &self,
        name: &ChunkName,
        bytes: Vec<u8>,
        hashability: Hashability,
        shard: Shard,
    ) -> Result<(), ChunkStoreError> {
        if hashability == Hashability::Hashable {
            verify_hash(name, &bytes)?;
        }
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(name) {
            if existing.bytes == bytes {
                return Ok(()); // idempotent re-store
            }
        }
        let len = bytes.len() as u64;
        let used = self.used.load(Ordering::Acquire);
        if used + len > self.budget {
            return Err(ChunkStoreError::StorageFull {
                requested: len,
                available: self.budget.saturating_sub(used),
            });
        }
        entries.insert(*name, Entry { bytes, shard });
        self.used.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    async fn load(&self, name: &ChunkName) -> Result<Vec<u8>, ChunkStoreError> {
        self.entries
            .lock()
            .await
            .get(name)
            .map(|e| e.bytes.clone())
            .ok_or(ChunkStoreError::NotFound(*name))
    }

    async fn delete(&self, name: &ChunkName) -> Result<(), ChunkStoreError> {
        let mut entries = self.entries.lock().await;
        match entries.remove(name) {
            Some(entry) => {
                self.used
                    .fetch_sub(entry.bytes.len() as u64, Ordering::AcqRel);
                Ok(())
            }
            None => Err(ChunkStoreError::NotFound(*name)),
        }
    }

    async fn size(&self, name: &ChunkName) -> Result<u64, ChunkStoreError> {
        self.entries
            .lock()
            .await
            .get(name)
            .map(|e| e.bytes.len() as u64)
            .ok_or(ChunkStoreError::NotFound(*name))
    }

    async fn available(&self) -> u64 {
        self.budget.saturating_sub(self.used.load(Ordering::Acquire))
    }

    async fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

/// On-disk chunk store: one file per chunk, filename = hex(chunk_name),
/// directory = `<root>/<hashable|opaque>/<normal|cache|outgoing>/` (§6.2).
/// Re-opening the store walks the shard directories to repopulate the
/// in-memory used-bytes counter.
pub struct DiskChunkStore {
    root: PathBuf,
    budget: u64,
    used: AtomicU64,
    write_lock: Mutex<()>,
}

impl DiskChunkStore {
    pub async fn open(root: impl AsRef<Path>, budget: u64) -> Result<Arc<Self>, ChunkStoreError> {
        let root = root.as_ref().to_path_buf();
        let mut used = 0u64;
        for hashability in [Hashability::Hashable, Hashability::Opaque] {
            for shard in [Shard::Normal, Shard::Cache, Shard::Outgoing] {
                let dir = root.join(hashability.dirname()).join(shard.dirname());
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
                let mut entries = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| ChunkStoreError::Io(e.to_string()))?
                {
                    if let Ok(meta) = entry.metadata().await {
                        used += meta.len();
                    }
                }
            }
        }
        Ok(Arc::new(Self {
            root,
            budget,
            used: AtomicU64::new(used),
            write_lock: Mutex::new(()),
        }))
    }

    fn path_for(&self, name: &ChunkName, hashability: Hashability, shard: Shard) -> PathBuf {
        self.root
            .join(hashability.dirname())
            .join(shard.dirname())
            .join(name.to_hex())
    }

    async fn find(&self, name: &ChunkName) -> Option<PathBuf> {
        for hashability in [Hashability::Hashable, Hashability::Opaque] {
            for shard in [Shard::Normal, Shard::Cache, Shard::Outgoing] {
                let path = self.path_for(name, hashability, shard);
                if tokio::fs::metadata(&path).await.is_ok() {
                    return Some(path);
                }
            }
        }
        None
    }
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
    async fn has(&self, name: &ChunkName) -> bool {
        self.find(name).await.is_some()
    }

    async fn store(
        &self,
        name: &ChunkName,
        bytes: Vec<u8>,
        hashability: Hashability,
        shard: Shard,
    ) -> Result<(), ChunkStoreError> {
        if hashability == Hashability::Hashable {
            verify_hash(name, &bytes)?;
        }
        let _guard = self.write_lock.lock().await;
        if let Some(existing_path) = self.find(name).await {
            let existing = tokio::fs::read(&existing_path)
                .await
                .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
            if existing == bytes {
                return Ok(());
            }
        }
        let len = bytes.len() as u64;
        let used = self.used.load(Ordering::Acquire);
        if used + len > self.budget {
            return Err(ChunkStoreError::StorageFull {
                requested: len,
                available: self.budget.saturating_sub(used),
            });
        }
        let path = self.path_for(name, hashability, shard);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
        self.used.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    async fn load(&self, name: &ChunkName) -> Result<Vec<u8>, ChunkStoreError> {
        let path = self
            .find(name)
            .await
            .ok_or(ChunkStoreError::NotFound(*name))?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ChunkStoreError::Io(e.to_string()))
    }

    async fn delete(&self, name: &ChunkName) -> Result<(), ChunkStoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self
            .find(name)
            .await
            .ok_or(ChunkStoreError::NotFound(*name))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
        self.used.fetch_sub(meta.len(), Ordering::AcqRel);
        Ok(())
    }

    async fn size(&self, name: &ChunkName) -> Result<u64, ChunkStoreError> {
        let path = self
            .find(name)
            .await
            .ok_or(ChunkStoreError::NotFound(*name))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ChunkStoreError::Io(e.to_string()))?;
        Ok(meta.len())
    }

    async fn available(&self) -> u64 {
        self.budget.saturating_sub(self.used.load(Ordering::Acquire))
    }

    async fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of(bytes: &[u8]) -> ChunkName {
        ChunkName::new(Sha512::digest(bytes).into())
    }

    #[tokio::test]
    async fn memory_store_rejects_hash_mismatch() {
        let store = MemoryChunkStore::new(1_000_000);
        let bytes = b"hello world".to_vec();
        let wrong_name = ChunkName::new([0u8; 64]);
        let err = store
            .store(&wrong_name, bytes, Hashability::Hashable, Shard::Normal)
            .await
            .unwrap_err();
        assert_eq!(err, ChunkStoreError::HashMismatch(wrong_name));
    }

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let store = MemoryChunkStore::new(1_000_000);
        let bytes = b"hello world".to_vec();
        let name = name_of(&bytes);
        store
            .store(&name, bytes.clone(), Hashability::Hashable, Shard::Normal)
            .await
            .unwrap();
        assert!(store.has(&name).await);
        assert_eq!(store.load(&name).await.unwrap(), bytes);
        assert_eq!(store.used().await, bytes.len() as u64);
    }

    #[tokio::test]
    async fn repeated_identical_store_is_idempotent() {
        let store = MemoryChunkStore::new(1_000_000);
        let bytes = b"hello world".to_vec();
        let name = name_of(&bytes);
        store
            .store(&name, bytes.clone(), Hashability::Hashable, Shard::Normal)
            .await
            .unwrap();
        store
            .store(&name, bytes.clone(), Hashability::Hashable, Shard::Normal)
            .await
            .unwrap();
        assert_eq!(store.used().await, bytes.len() as u64);
    }

    #[tokio::test]
    async fn store_rejects_when_over_budget() {
        let store = MemoryChunkStore::new(5);
        let bytes = b"hello world".to_vec(); // 11 bytes
        let name = name_of(&bytes);
        let err = store
            .store(&name, bytes, Hashability::Hashable, Shard::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::StorageFull { .. }));
    }

    #[tokio::test]
    async fn delete_frees_budget() {
        let store = MemoryChunkStore::new(1_000_000);
        let bytes = b"hello world".to_vec();
        let name = name_of(&bytes);
        store
            .store(&name, bytes, Hashability::Hashable, Shard::Normal)
            .await
            .unwrap();
        store.delete(&name).await.unwrap();
        assert_eq!(store.used().await, 0);
        assert!(!store.has(&name).await);
    }

    #[tokio::test]
    async fn opaque_chunks_skip_hash_verification() {
        let store = MemoryChunkStore::new(1_000_000);
        let name = ChunkName::new([3u8; 64]);
        store
            .store(&name, b"cache copy".to_vec(), Hashability::Opaque, Shard::Cache)
            .await
            .unwrap();
        assert!(store.has(&name).await);
    }

    #[tokio::test]
    async fn disk_store_roundtrips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = b"persisted chunk".to_vec();
        let name = name_of(&bytes);
        {
            let store = DiskChunkStore::open(dir.path(), 1_000_000).await.unwrap();
            store
                .store(&name, bytes.clone(), Hashability::Hashable, Shard::Normal)
                .await
                .unwrap();
        }
        let reopened = DiskChunkStore::open(dir.path(), 1_000_000).await.unwrap();
        assert_eq!(reopened.used().await, bytes.len() as u64);
        assert_eq!(reopened.load(&name).await.unwrap(), bytes);
    }
}
