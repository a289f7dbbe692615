//! Event type definitions for cache activity reporting.

use crate::core::coordinator::Decision;
use crate::core::hasher::ContentDigest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All events emitted by the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Per-image decisions and rejections
    Ingest(IngestEvent),
    /// Records leaving the cache
    Eviction(EvictionEvent),
    /// Duplicate index and metadata recovery
    Index(IndexEvent),
    /// Batch submission progress
    Batch(BatchEvent),
}

/// Events for single submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngestEvent {
    /// A submission reached a terminal decision
    Decided(Decision),
    /// A submission failed before any state changed
    Rejected { origin_id: String, reason: String },
}

/// Why a record was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Total size exceeded the budget
    Budget,
    /// Older than the requested maximum age
    Expired,
}

/// Events from eviction passes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvictionEvent {
    /// One record was removed
    Evicted {
        digest: ContentDigest,
        size_bytes: u64,
        reason: EvictionReason,
    },
    /// An eviction pass removed at least one record
    PassCompleted(EvictionSummary),
}

/// Outcome of one eviction or expiry pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvictionSummary {
    /// Digests removed, in eviction order
    pub evicted: Vec<ContentDigest>,
    pub freed_bytes: u64,
    /// Store size after the pass
    pub total_bytes: u64,
}

impl EvictionSummary {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// Events about the in-memory index and persisted metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexEvent {
    /// Index rebuilt from stored records at startup
    Rebuilt { entries: usize, bands: usize },
    /// Metadata database was unreadable and has been rebuilt from payloads
    CorruptionRecovered {
        reason: String,
        quarantined_to: Option<PathBuf>,
        recovered_payloads: usize,
    },
    /// Metadata and payload files disagreed and were reconciled
    Reconciled {
        dropped_records: usize,
        recovered_payloads: usize,
        discarded_payloads: usize,
    },
}

/// Events during batch submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchEvent {
    /// Batch has started
    Started { total_images: usize },
    /// Progress update after each image
    Progress(BatchProgress),
    /// Batch completed
    Completed { summary: BatchSummary },
}

/// Progress information during a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Images decided or failed so far
    pub completed: usize,
    /// Total images in the batch
    pub total: usize,
}

/// Summary of batch results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_images: usize,
    pub new_images: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    /// Images rejected with a per-image or storage error
    pub failed: usize,
    /// Records evicted while the batch ran
    pub evicted: usize,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Budget => write!(f, "budget"),
            EvictionReason::Expired => write!(f, "expired"),
        }
    }
}
