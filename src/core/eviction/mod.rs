//! # Eviction Module
//!
//! Keeps the store within its byte budget.
//!
//! Records leave in LRU order: oldest `last_accessed_at` first, ties broken
//! by `stored_at` and then digest. Protected digests (the image just written,
//! anything an in-flight submission has claimed) are skipped.
//!
//! Callers hold the coordinator's eviction gate exclusively while a pass
//! runs, so no comparison is reading a record that disappears under it.

use crate::core::hasher::ContentDigest;
use crate::core::index::DuplicateIndex;
use crate::core::store::{ImageRecord, ImageStore};
use crate::error::{CacheEngineError, StoreError};
use crate::events::{Event, EventSender, EvictionEvent, EvictionReason, EvictionSummary};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// LRU budget enforcement
pub struct EvictionManager {
    budget_bytes: u64,
    events: EventSender,
}

impl EvictionManager {
    pub fn new(budget_bytes: u64, events: EventSender) -> Self {
        Self { budget_bytes, events }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Reject payloads that could never fit, before anything is touched
    pub fn check_fits(&self, size_bytes: u64) -> Result<(), CacheEngineError> {
        if size_bytes > self.budget_bytes {
            return Err(CacheEngineError::OversizedImage {
                size_bytes,
                budget_bytes: self.budget_bytes,
            });
        }
        Ok(())
    }

    /// Evict least recently used records until the store fits the budget.
    ///
    /// Stops early if only protected records remain; the store then stays
    /// over budget until the next pass.
    pub fn maybe_evict(
        &self,
        store: &dyn ImageStore,
        index: &mut DuplicateIndex,
        protected: &HashSet<ContentDigest>,
    ) -> Result<EvictionSummary, StoreError> {
        if store.total_size() <= self.budget_bytes {
            return Ok(EvictionSummary {
                total_bytes: store.total_size(),
                ..EvictionSummary::default()
            });
        }

        let mut summary = EvictionSummary::default();
        for record in store.eviction_order()? {
            if store.total_size() <= self.budget_bytes {
                break;
            }
            if protected.contains(&record.content_digest) {
                continue;
            }
            self.evict_one(store, index, &record, EvictionReason::Budget, &mut summary)?;
        }
        summary.total_bytes = store.total_size();

        if summary.total_bytes > self.budget_bytes {
            tracing::warn!(
                total = summary.total_bytes,
                budget = self.budget_bytes,
                protected = protected.len(),
                "Still over budget, remaining records are in use"
            );
        }
        self.finish(summary)
    }

    /// Remove every unprotected record stored before `cutoff`
    pub fn expire_before(
        &self,
        store: &dyn ImageStore,
        index: &mut DuplicateIndex,
        cutoff: DateTime<Utc>,
        protected: &HashSet<ContentDigest>,
    ) -> Result<EvictionSummary, StoreError> {
        let mut summary = EvictionSummary::default();
        for record in store.records()? {
            if record.stored_at >= cutoff || protected.contains(&record.content_digest) {
                continue;
            }
            self.evict_one(store, index, &record, EvictionReason::Expired, &mut summary)?;
        }
        summary.total_bytes = store.total_size();
        self.finish(summary)
    }

    fn evict_one(
        &self,
        store: &dyn ImageStore,
        index: &mut DuplicateIndex,
        record: &ImageRecord,
        reason: EvictionReason,
        summary: &mut EvictionSummary,
    ) -> Result<(), StoreError> {
        let digest = record.content_digest;
        let Some(freed) = store.remove(&digest)? else {
            return Ok(());
        };
        index.remove(&digest);

        tracing::debug!(digest = %digest.short(), size = freed, %reason, "Evicted record");
        self.events.send(Event::Eviction(EvictionEvent::Evicted {
            digest,
            size_bytes: freed,
            reason,
        }));

        summary.evicted.push(digest);
        summary.freed_bytes += freed;
        Ok(())
    }

    fn finish(&self, summary: EvictionSummary) -> Result<EvictionSummary, StoreError> {
        if !summary.is_empty() {
            tracing::info!(
                evicted = summary.evicted.len(),
                freed = summary.freed_bytes,
                total = summary.total_bytes,
                "Eviction pass complete"
            );
            self.events
                .send(Event::Eviction(EvictionEvent::PassCompleted(summary.clone())));
        }
        Ok(summary)
    }
}
