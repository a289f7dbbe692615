//! In-memory store backend for testing.

use super::{ImageRecord, ImageStore, MonotonicClock, RecordMetadata};
use crate::core::hasher::ContentDigest;
use crate::error::StoreError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Entry {
    record: ImageRecord,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ContentDigest, Entry>,
    origins: HashMap<String, ContentDigest>,
}

/// In-memory store
///
/// Same semantics as `DiskStore`, nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: MonotonicClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Corrupted {
            path: PathBuf::from("memory"),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Corrupted {
            path: PathBuf::from("memory"),
        })
    }
}

fn not_found(digest: &ContentDigest) -> StoreError {
    StoreError::NotFound {
        digest: digest.to_hex(),
    }
}

impl ImageStore for MemoryStore {
    fn put(
        &self,
        digest: &ContentDigest,
        bytes: &[u8],
        metadata: RecordMetadata,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        if inner.entries.contains_key(digest) {
            return Ok(false);
        }
        let now = self.clock.now();
        inner.origins.insert(metadata.origin_id.clone(), *digest);
        inner.entries.insert(
            *digest,
            Entry {
                record: ImageRecord {
                    content_digest: *digest,
                    perceptual_signature: metadata.perceptual_signature,
                    size_bytes: bytes.len() as u64,
                    origin_id: metadata.origin_id,
                    stored_at: now,
                    last_accessed_at: now,
                    ref_count: 1,
                },
                bytes: bytes.to_vec(),
            },
        );
        Ok(true)
    }

    fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.write()?;
        let entry = inner.entries.get_mut(digest).ok_or_else(|| not_found(digest))?;
        entry.record.last_accessed_at = self.clock.now();
        Ok(entry.bytes.clone())
    }

    fn peek(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError> {
        self.read()?
            .entries
            .get(digest)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| not_found(digest))
    }

    fn record(&self, digest: &ContentDigest) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.read()?.entries.get(digest).map(|entry| entry.record.clone()))
    }

    fn record_hit(
        &self,
        digest: &ContentDigest,
        origin_id: Option<&str>,
    ) -> Result<ImageRecord, StoreError> {
        let mut inner = self.write()?;
        let entry = inner.entries.get_mut(digest).ok_or_else(|| not_found(digest))?;
        entry.record.ref_count += 1;
        entry.record.last_accessed_at = self.clock.now();
        let record = entry.record.clone();
        if let Some(origin_id) = origin_id {
            inner.origins.insert(origin_id.to_string(), *digest);
        }
        Ok(record)
    }

    fn lookup_origin(&self, origin_id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .origins
            .get(origin_id)
            .and_then(|digest| inner.entries.get(digest))
            .map(|entry| entry.record.clone()))
    }

    fn remove(&self, digest: &ContentDigest) -> Result<Option<u64>, StoreError> {
        let mut inner = self.write()?;
        let Some(entry) = inner.entries.remove(digest) else {
            return Ok(None);
        };
        inner.origins.retain(|_, aliased| aliased != digest);
        Ok(Some(entry.record.size_bytes))
    }

    fn total_size(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Memory store lock poisoned, reading entries anyway");
            poisoned.into_inner()
        });
        inner.entries.values().map(|e| e.record.size_bytes).sum()
    }

    fn records(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let mut records: Vec<_> = self
            .read()?
            .entries
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| (r.stored_at, r.content_digest));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::PerceptualSignature;
    use std::sync::Arc;

    fn metadata() -> RecordMetadata {
        RecordMetadata {
            perceptual_signature: PerceptualSignature::new(0xF0F0),
            origin_id: "mobile-upload".to_string(),
        }
    }

    #[test]
    fn put_and_get() {
        let store = MemoryStore::new();
        let digest = ContentDigest::from_bytes([1; 32]);

        assert!(store.put(&digest, b"receipt", metadata()).unwrap());
        assert!(!store.put(&digest, b"receipt", metadata()).unwrap());

        assert_eq!(store.get(&digest).unwrap(), b"receipt");
        assert_eq!(store.total_size(), 7);
    }

    #[test]
    fn hits_and_removal() {
        let store = MemoryStore::new();
        let digest = ContentDigest::from_bytes([2; 32]);
        store.put(&digest, b"abc", metadata()).unwrap();

        assert_eq!(store.record_hit(&digest, None).unwrap().ref_count, 2);
        assert_eq!(store.remove(&digest).unwrap(), Some(3));
        assert!(store.peek(&digest).unwrap_err().is_not_found());
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn origins_follow_hits_and_removal() {
        let store = MemoryStore::new();
        let (a, b) = (ContentDigest::from_bytes([3; 32]), ContentDigest::from_bytes([4; 32]));
        store.put(&a, b"a", metadata()).unwrap();
        store.put(&b, b"b", metadata()).unwrap();

        assert_eq!(store.lookup_origin("mobile-upload").unwrap().unwrap().content_digest, b);

        store.record_hit(&a, Some("mail:7")).unwrap();
        assert_eq!(store.lookup_origin("mail:7").unwrap().unwrap().content_digest, a);

        store.remove(&a).unwrap();
        assert_eq!(store.lookup_origin("mail:7").unwrap(), None);
        assert!(store.lookup_origin("mobile-upload").unwrap().is_some());
    }

    #[test]
    fn total_size_survives_a_poisoned_lock() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(&ContentDigest::from_bytes([5; 32]), b"12345", metadata())
            .unwrap();

        let poisoner = Arc::clone(&store);
        let panicked = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("poison the store lock");
        })
        .join();

        assert!(panicked.is_err());
        assert!(store.inner.is_poisoned());
        assert_eq!(store.total_size(), 5);
    }

    #[test]
    fn records_are_ordered_by_storage_time() {
        let store = MemoryStore::new();
        let first = ContentDigest::from_bytes([9; 32]);
        let second = ContentDigest::from_bytes([1; 32]);
        store.put(&first, b"a", metadata()).unwrap();
        store.put(&second, b"b", metadata()).unwrap();

        let digests: Vec<_> = store
            .records()
            .unwrap()
            .into_iter()
            .map(|r| r.content_digest)
            .collect();

        assert_eq!(digests, vec![first, second]);
    }
}
