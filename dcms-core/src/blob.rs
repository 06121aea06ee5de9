//! Opaque content storage
//!
//! File content is stored once per distinct payload, addressed by the SHA-256
//! of its bytes. The relational `files` tables only hold the address, so a
//! fresh content identity (for example a backup copy) costs one row and no
//! additional blob.

use crate::error::{CmsError, Result};
use bytes::Bytes;
use fjall::{Database, KeyspaceCreateOptions};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Content address of a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId([u8; 32]);

impl BlobId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the address of `data`
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CmsError::Serialization(format!("invalid blob id {}: {}", hex_str, e)))?;
        if bytes.len() != 32 {
            return Err(CmsError::Serialization(format!(
                "invalid blob id length {} for {}",
                bytes.len(),
                hex_str
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// On-disk framing of a blob before compression
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBlob {
    data: Vec<u8>,
    size: u64,
}

impl StoredBlob {
    fn encode(data: &[u8]) -> Result<Vec<u8>> {
        let framed = bincode::serialize(&StoredBlob { data: data.to_vec(), size: data.len() as u64 })?;
        Ok(zstd::encode_all(framed.as_slice(), 3)?)
    }

    fn decode(raw: &[u8]) -> Result<Bytes> {
        let framed = zstd::decode_all(raw)?;
        let blob: StoredBlob = bincode::deserialize(&framed)?;
        if blob.size != blob.data.len() as u64 {
            return Err(CmsError::Serialization(format!(
                "blob size mismatch: header {} vs payload {}",
                blob.size,
                blob.data.len()
            )));
        }
        Ok(Bytes::from(blob.data))
    }
}

/// Content store keyed by content address
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its address. Idempotent.
    fn put(&self, data: &[u8]) -> Result<BlobId>;

    /// Load a blob; `NotFound` if absent.
    fn get(&self, id: &BlobId) -> Result<Bytes>;

    fn exists(&self, id: &BlobId) -> Result<bool>;

    fn delete(&self, id: &BlobId) -> Result<()>;
}

/// Blob store backed by a Fjall LSM keyspace with an LRU read cache
pub struct FjallBlobStore {
    db: Database,
    objects: fjall::Keyspace,
    cache: Mutex<LruCache<BlobId, Bytes>>,
}

impl FjallBlobStore {
    /// Open or create the blob keyspace under `path`
    pub fn open(path: &Path, cache_capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let db = Database::builder(path)
            .open()
            .map_err(|e| CmsError::Store(format!("Failed to open blob store: {}", e)))?;

        let objects = db
            .keyspace("objects", || KeyspaceCreateOptions::default())
            .map_err(|e| CmsError::Store(format!("Failed to open objects keyspace: {}", e)))?;

        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self { db, objects, cache: Mutex::new(LruCache::new(capacity)) })
    }

    /// Persist data to disk
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| CmsError::Store(format!("Failed to persist blob store: {}", e)))?;
        Ok(())
    }

    fn cached(&self, id: &BlobId) -> Option<Bytes> {
        self.cache.lock().ok().and_then(|mut c| c.get(id).cloned())
    }

    fn remember(&self, id: BlobId, data: Bytes) {
        if let Ok(mut c) = self.cache.lock() {
            c.put(id, data);
        }
    }
}

impl BlobStore for FjallBlobStore {
    fn put(&self, data: &[u8]) -> Result<BlobId> {
        let id = BlobId::from_data(data);
        if self.exists(&id)? {
            return Ok(id);
        }
        let key = id.to_hex();
        let encoded = StoredBlob::encode(data)?;
        self.objects
            .insert(&key, encoded.as_slice())
            .map_err(|e| CmsError::Store(format!("Blob put failed: {}", e)))?;
        Ok(id)
    }

    fn get(&self, id: &BlobId) -> Result<Bytes> {
        if let Some(hit) = self.cached(id) {
            return Ok(hit);
        }
        let key = id.to_hex();
        let raw = self
            .objects
            .get(&key)
            .map_err(|e| CmsError::Store(format!("Blob get failed: {}", e)))?
            .ok_or_else(|| CmsError::NotFound(format!("blob {}", id)))?;
        let data = StoredBlob::decode(&raw)?;
        self.remember(*id, data.clone());
        Ok(data)
    }

    fn exists(&self, id: &BlobId) -> Result<bool> {
        if self.cached(id).is_some() {
            return Ok(true);
        }
        let key = id.to_hex();
        Ok(self
            .objects
            .get(&key)
            .map_err(|e| CmsError::Store(format!("Blob exists check failed: {}", e)))?
            .is_some())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        if let Ok(mut c) = self.cache.lock() {
            c.pop(id);
        }
        let key = id.to_hex();
        self.objects
            .remove(&key)
            .map_err(|e| CmsError::Store(format!("Blob delete failed: {}", e)))?;
        Ok(())
    }
}

/// Process-local blob store used for in-memory repositories and tests
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<BlobId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: &[u8]) -> Result<BlobId> {
        let id = BlobId::from_data(data);
        self.objects
            .write()
            .map_err(|_| CmsError::Store("blob map poisoned".into()))?
            .entry(id)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(id)
    }

    fn get(&self, id: &BlobId) -> Result<Bytes> {
        self.objects
            .read()
            .map_err(|_| CmsError::Store("blob map poisoned".into()))?
            .get(id)
            .cloned()
            .ok_or_else(|| CmsError::NotFound(format!("blob {}", id)))
    }

    fn exists(&self, id: &BlobId) -> Result<bool> {
        Ok(self
            .objects
            .read()
            .map_err(|_| CmsError::Store("blob map poisoned".into()))?
            .contains_key(id))
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| CmsError::Store("blob map poisoned".into()))?
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_id_hex_roundtrip() {
        let id = BlobId::from_data(b"hello world");
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(BlobId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(BlobId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_memory_store_dedups() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap().as_ref(), b"same");
        store.delete(&a).unwrap();
        assert!(store.get(&a).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fjall_store_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let id;
        {
            let store = FjallBlobStore::open(tmp.path(), 4).unwrap();
            id = store.put(b"<html>persisted</html>").unwrap();
            assert!(store.exists(&id).unwrap());
            store.persist().unwrap();
        }
        let store = FjallBlobStore::open(tmp.path(), 4).unwrap();
        assert_eq!(store.get(&id).unwrap().as_ref(), b"<html>persisted</html>");
    }

    #[test]
    fn test_fjall_store_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let store = FjallBlobStore::open(tmp.path(), 4).unwrap();
        let missing = BlobId::from_data(b"never stored");
        assert!(!store.exists(&missing).unwrap());
        assert!(store.get(&missing).unwrap_err().is_not_found());
    }
}
