//! # Store Module
//!
//! Content-addressed persistence for image payloads and their metadata.
//!
//! ## Guarantees
//! - One record per content digest; re-storing identical bytes is a no-op
//! - A `put` either commits payload and metadata together or leaves nothing
//! - Reads via `get` bump `last_accessed_at`, which drives LRU eviction
//!
//! ## Backends
//! - `DiskStore` - payload files plus a SQLite metadata table, self-healing
//!   on startup
//! - `MemoryStore` - for tests and throwaway caches

mod disk;
mod memory;
mod traits;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use traits::ImageStore;

use crate::core::hasher::{ContentDigest, PerceptualSignature};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// One uniquely stored image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub content_digest: ContentDigest,
    pub perceptual_signature: PerceptualSignature,
    pub size_bytes: u64,
    /// Where the image came from; informational only
    pub origin_id: String,
    pub stored_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// How many submissions resolved to this record, including the first
    pub ref_count: u64,
}

impl ImageRecord {
    /// Sort key for LRU eviction: least recently used, then oldest, then digest
    pub fn eviction_key(&self) -> (DateTime<Utc>, DateTime<Utc>, ContentDigest) {
        (self.last_accessed_at, self.stored_at, self.content_digest)
    }
}

/// Caller-supplied part of a record; the store fills in size and timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub perceptual_signature: PerceptualSignature,
    pub origin_id: String,
}

/// Aggregate numbers over the stored records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    /// Submissions that resolved to an existing record (Σ ref_count - 1)
    pub duplicate_count: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl StoreStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ImageRecord>) -> Self {
        let mut stats = StoreStats::default();
        for record in records {
            stats.entry_count += 1;
            stats.total_bytes += record.size_bytes;
            stats.duplicate_count += record.ref_count.saturating_sub(1);
            stats.oldest_entry = Some(match stats.oldest_entry {
                Some(t) => t.min(record.stored_at),
                None => record.stored_at,
            });
            stats.newest_entry = Some(match stats.newest_entry {
                Some(t) => t.max(record.stored_at),
                None => record.stored_at,
            });
        }
        stats
    }
}

/// What startup reconciliation had to repair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Set when the metadata database was unreadable and got rebuilt
    pub corruption: Option<String>,
    /// Where the broken database was moved
    pub quarantined_to: Option<PathBuf>,
    /// Metadata rows whose payload was missing or truncated
    pub dropped_records: usize,
    /// Payloads without metadata that were re-adopted
    pub recovered_payloads: usize,
    /// Payloads that were unreadable or failed digest verification
    pub discarded_payloads: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.corruption.is_none()
            && self.dropped_records == 0
            && self.recovered_payloads == 0
            && self.discarded_payloads == 0
    }
}

/// Strictly increasing microsecond timestamps.
///
/// Two reads in the same microsecond still get distinct, ordered times, so
/// LRU order is total and `last_accessed_at` never moves backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: Mutex<i64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let mut last = self.last_micros.lock().unwrap_or_else(|e| e.into_inner());
        let next = wall.max(*last + 1);
        *last = next;
        DateTime::from_timestamp_micros(next).unwrap_or_default()
    }

    /// Never hand out a time at or before `seen` (e.g. persisted timestamps)
    pub fn observe(&self, seen: DateTime<Utc>) {
        let mut last = self.last_micros.lock().unwrap_or_else(|e| e.into_inner());
        *last = (*last).max(seen.timestamp_micros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u8, stored_micros: i64, accessed_micros: i64, refs: u64) -> ImageRecord {
        ImageRecord {
            content_digest: ContentDigest::from_bytes([n; 32]),
            perceptual_signature: PerceptualSignature::new(n as u64),
            size_bytes: 100 * n as u64,
            origin_id: format!("drive:{}", n),
            stored_at: DateTime::from_timestamp_micros(stored_micros).unwrap(),
            last_accessed_at: DateTime::from_timestamp_micros(accessed_micros).unwrap(),
            ref_count: refs,
        }
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn clock_respects_observed_future_time() {
        let clock = MonotonicClock::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        clock.observe(future);
        assert!(clock.now() > future);
    }

    #[test]
    fn eviction_key_orders_by_access_then_storage() {
        let a = record(1, 10, 50, 1);
        let b = record(2, 5, 50, 1);
        let c = record(3, 1, 60, 1);
        let mut records = vec![c.clone(), a.clone(), b.clone()];
        records.sort_by_key(|r| r.eviction_key());
        assert_eq!(records, vec![b, a, c]);
    }

    #[test]
    fn stats_sum_sizes_and_duplicates() {
        let records = [record(1, 10, 10, 3), record(2, 20, 20, 1)];
        let stats = StoreStats::from_records(records.iter());
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.total_bytes, 300);
        assert_eq!(stats.duplicate_count, 2);
        assert_eq!(stats.oldest_entry, Some(records[0].stored_at));
        assert_eq!(stats.newest_entry, Some(records[1].stored_at));
    }
}
