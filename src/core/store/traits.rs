//! Store backend trait definition.

use super::{ImageRecord, RecordMetadata, RecoveryReport, StoreStats};
use crate::core::hasher::ContentDigest;
use crate::error::StoreError;

/// Trait for content-addressed image stores
pub trait ImageStore: Send + Sync {
    /// Store a payload under its digest.
    ///
    /// Returns `Ok(false)` without touching anything when the digest is
    /// already stored. On error nothing is left behind.
    fn put(
        &self,
        digest: &ContentDigest,
        bytes: &[u8],
        metadata: RecordMetadata,
    ) -> Result<bool, StoreError>;

    /// Read a payload and mark the record as accessed
    fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError>;

    /// Read a payload without counting it as an access.
    ///
    /// Used when comparing candidates, which shouldn't keep them alive.
    fn peek(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError>;

    /// Metadata snapshot, if stored
    fn record(&self, digest: &ContentDigest) -> Result<Option<ImageRecord>, StoreError>;

    fn contains(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        Ok(self.record(digest)?.is_some())
    }

    /// Count a duplicate submission against a record: bump `ref_count` and
    /// `last_accessed_at`. Returns the updated record.
    ///
    /// With `Some(origin_id)` the origin is also aliased to this record, in
    /// the same commit.
    fn record_hit(
        &self,
        digest: &ContentDigest,
        origin_id: Option<&str>,
    ) -> Result<ImageRecord, StoreError>;

    /// Record an origin resolved to, if that record is still stored.
    ///
    /// `put` registers the record's own origin; duplicates register theirs
    /// through `record_hit`. The latest registration of an origin wins.
    fn lookup_origin(&self, origin_id: &str) -> Result<Option<ImageRecord>, StoreError>;

    /// Delete payload, metadata and origin aliases; returns the freed size
    /// if it existed.
    ///
    /// Either all of it goes or none of it does.
    fn remove(&self, digest: &ContentDigest) -> Result<Option<u64>, StoreError>;

    /// Sum of stored payload sizes
    fn total_size(&self) -> u64;

    /// All records, in no particular order
    fn records(&self) -> Result<Vec<ImageRecord>, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.records()?;
        Ok(StoreStats::from_records(records.iter()))
    }

    /// Records ordered least-recently-used first
    fn eviction_order(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let mut records = self.records()?;
        records.sort_by_key(|r| r.eviction_key());
        Ok(records)
    }

    /// What had to be repaired when the store was opened
    fn recovery_report(&self) -> RecoveryReport {
        RecoveryReport::default()
    }
}
