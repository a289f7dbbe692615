//! # Coordinator Module
//!
//! The single entry point that mutates the cache.
//!
//! ## Submission Flow
//! 1. Reject payloads larger than the whole budget
//! 2. Decode and fingerprint (digest + perceptual signature)
//! 3. Claim the digest; concurrent submissions of the same bytes queue here
//! 4. Exact hit: count it against the stored record
//! 5. Otherwise look up nearby signatures in the duplicate index and compare
//!    candidates, closest first; payloads are only read for the structural tier
//! 6. Near match: count it against the matched record (and, under
//!    `Persist`, store the copy first)
//! 7. No match: store and index
//! 8. If anything was stored, run an eviction pass
//!
//! Every origin a submission arrives from is aliased to the record it
//! resolved to; see [`CacheCoordinator::lookup_origin`].
//!
//! ## Locking
//! Lock order is claims, then the eviction gate, then the index, then the
//! store's own lock. Comparisons, hits and inserts hold the gate shared;
//! eviction holds it exclusively. Once a payload is stored the decision
//! stands: a failing eviction pass is logged, not returned.
//!
//! ## Example
//! ```rust,ignore
//! let cache = CacheCoordinator::open(CacheConfig::default())?;
//! let decision = cache.submit(IncomingImage::new(bytes, "drive:receipts/2024-03.jpg"))?;
//! if decision.is_duplicate() {
//!     println!("already have {}", decision.matched_digest.unwrap());
//! }
//! ```

mod batch;
mod claim;

pub use batch::BatchResult;

use self::claim::ClaimSet;
use crate::config::{CacheConfig, NearDuplicatePolicy};
use crate::core::eviction::EvictionManager;
use crate::core::hasher::{ContentDigest, ContentHasher, FastDecoder, PerceptualSignature};
use crate::core::index::{DuplicateIndex, IndexStats};
use crate::core::similarity::{Comparand, SimilarityEngine, StructuralMetric, Verdict};
use crate::core::store::{DiskStore, ImageRecord, ImageStore, RecordMetadata, RecoveryReport};
use crate::error::{CacheEngineError, IndexError, Result};
use crate::events::{null_sender, Event, EventSender, EvictionSummary, IndexEvent, IngestEvent};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An image offered to the cache
#[derive(Debug, Clone)]
pub struct IncomingImage {
    pub bytes: Vec<u8>,
    /// Where the image came from; recorded, never interpreted
    pub origin_id: String,
}

impl IncomingImage {
    pub fn new(bytes: impl Into<Vec<u8>>, origin_id: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            origin_id: origin_id.into(),
        }
    }
}

/// How a submission was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Not seen before; stored
    New,
    /// Byte-identical to a stored record
    ExactDuplicate,
    /// Visually the same receipt as a stored record
    NearDuplicate,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::New => write!(f, "new"),
            Outcome::ExactDuplicate => write!(f, "exact-duplicate"),
            Outcome::NearDuplicate => write!(f, "near-duplicate"),
        }
    }
}

/// Terminal result of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub content_digest: ContentDigest,
    pub origin_id: String,
    pub outcome: Outcome,
    /// The stored record this image resolved to, for duplicates
    pub matched_digest: Option<ContentDigest>,
    /// 1.0 for exact duplicates, the verdict score for near duplicates,
    /// the best candidate score (or 0.0) for new images
    pub score: f64,
    /// Records evicted by the pass that followed this submission
    pub evicted: Vec<ContentDigest>,
}

impl Decision {
    pub fn is_duplicate(&self) -> bool {
        self.outcome != Outcome::New
    }
}

/// Cache-wide numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub entry_count: usize,
    /// Submissions resolved to an existing live record (Σ ref_count - 1)
    pub duplicate_count: u64,
    pub budget_bytes: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Share of the budget in use, in percent
    pub fn usage_percent(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.total_bytes as f64 * 100.0 / self.budget_bytes as f64
    }
}

/// Builder for [`CacheCoordinator`]
pub struct CoordinatorBuilder {
    config: CacheConfig,
    store: Option<Box<dyn ImageStore>>,
    metric: Option<Box<dyn StructuralMetric>>,
    events: Option<EventSender>,
}

impl CoordinatorBuilder {
    /// Use this store instead of a `DiskStore` under `cache_directory`
    pub fn store(mut self, store: Box<dyn ImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the structural metric (SSIM by default)
    pub fn metric(mut self, metric: Box<dyn StructuralMetric>) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the config, open the store and rebuild the index from it
    pub fn open(self) -> Result<CacheCoordinator> {
        let config = self.config;
        config.validate()?;

        let events = self.events.unwrap_or_else(null_sender);
        let store: Box<dyn ImageStore> = match self.store {
            Some(store) => store,
            None => Box::new(DiskStore::open(&config.cache_directory)?),
        };
        report_recovery(&store.recovery_report(), &events);

        let records = store.records()?;
        let index = DuplicateIndex::build(
            config.index_bands,
            records
                .iter()
                .map(|r| (r.perceptual_signature, r.content_digest)),
        )?;
        tracing::info!(
            dir = %config.cache_directory.display(),
            entries = index.len(),
            total_bytes = store.total_size(),
            budget = config.max_cache_size_bytes,
            "Cache opened"
        );
        events.send(Event::Index(IndexEvent::Rebuilt {
            entries: index.len(),
            bands: config.index_bands,
        }));

        let similarity = match self.metric {
            Some(metric) => SimilarityEngine::with_metric(config.similarity(), metric),
            None => SimilarityEngine::new(config.similarity()),
        };
        let eviction = EvictionManager::new(config.max_cache_size_bytes, events.clone());

        let coordinator = CacheCoordinator {
            config,
            store,
            index: RwLock::new(index),
            similarity,
            eviction,
            gate: RwLock::new(()),
            claims: ClaimSet::default(),
            events,
        };
        // The budget may have shrunk since the store was last used
        coordinator.enforce_budget()?;
        Ok(coordinator)
    }
}

fn report_recovery(report: &RecoveryReport, events: &EventSender) {
    if let Some(reason) = &report.corruption {
        events.send(Event::Index(IndexEvent::CorruptionRecovered {
            reason: reason.clone(),
            quarantined_to: report.quarantined_to.clone(),
            recovered_payloads: report.recovered_payloads,
        }));
    } else if !report.is_clean() {
        events.send(Event::Index(IndexEvent::Reconciled {
            dropped_records: report.dropped_records,
            recovered_payloads: report.recovered_payloads,
            discarded_payloads: report.discarded_payloads,
        }));
    }
}

/// Receipt image cache with duplicate detection.
///
/// `Send + Sync`; share it behind an `Arc` and call [`submit`](Self::submit)
/// from as many threads as needed.
pub struct CacheCoordinator {
    config: CacheConfig,
    store: Box<dyn ImageStore>,
    index: RwLock<DuplicateIndex>,
    similarity: SimilarityEngine,
    eviction: EvictionManager,
    /// Shared for comparisons and hits, exclusive for eviction
    gate: RwLock<()>,
    claims: ClaimSet,
    events: EventSender,
}

impl CacheCoordinator {
    pub fn builder(config: CacheConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store: None,
            metric: None,
            events: None,
        }
    }

    /// Open with a `DiskStore` under `config.cache_directory`
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::builder(config).open()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Decide what to do with one image and apply it.
    ///
    /// Errors leave the cache unchanged; see
    /// [`CacheEngineError::is_per_image`] for which ones to skip past.
    pub fn submit(&self, image: IncomingImage) -> Result<Decision> {
        match self.process(&image) {
            Ok(decision) => {
                tracing::debug!(
                    digest = %decision.content_digest.short(),
                    origin = %decision.origin_id,
                    outcome = %decision.outcome,
                    score = decision.score,
                    evicted = decision.evicted.len(),
                    "Submission decided"
                );
                self.events
                    .send(Event::Ingest(IngestEvent::Decided(decision.clone())));
                Ok(decision)
            }
            Err(error) => {
                tracing::debug!(origin = %image.origin_id, error = %error, "Submission rejected");
                self.events.send(Event::Ingest(IngestEvent::Rejected {
                    origin_id: image.origin_id,
                    reason: error.to_string(),
                }));
                Err(error)
            }
        }
    }

    fn process(&self, image: &IncomingImage) -> Result<Decision> {
        self.eviction.check_fits(image.bytes.len() as u64)?;

        let decoded = FastDecoder::decode(&image.bytes)?;
        let fingerprint = ContentHasher::fingerprint_decoded(&image.bytes, &decoded)?;
        let digest = fingerprint.content_digest;
        let signature = fingerprint.perceptual_signature;

        let _claim = self.claims.claim(digest);

        if self.exact_hit(&digest, &image.origin_id)?.is_some() {
            return Ok(Decision {
                content_digest: digest,
                origin_id: image.origin_id.clone(),
                outcome: Outcome::ExactDuplicate,
                matched_digest: Some(digest),
                score: 1.0,
                evicted: Vec::new(),
            });
        }

        let (mut decision, stored) = {
            let _gate = self.gate_read()?;
            let (matched, best_score) = self.near_match(&decoded, signature)?;
            match matched {
                Some((matched_digest, verdict)) => {
                    let stored =
                        self.absorb_near_duplicate(matched_digest, digest, signature, image)?;
                    let decision = Decision {
                        content_digest: digest,
                        origin_id: image.origin_id.clone(),
                        outcome: Outcome::NearDuplicate,
                        matched_digest: Some(matched_digest),
                        score: verdict.score,
                        evicted: Vec::new(),
                    };
                    (decision, stored)
                }
                None => {
                    let stored = self.insert_new(digest, signature, image)?;
                    let decision = Decision {
                        content_digest: digest,
                        origin_id: image.origin_id.clone(),
                        outcome: Outcome::New,
                        matched_digest: None,
                        score: best_score,
                        evicted: Vec::new(),
                    };
                    (decision, stored)
                }
            }
        };

        if stored {
            decision.evicted = self.evict_after_put();
        }
        Ok(decision)
    }

    /// Count a hit if the digest is stored
    fn exact_hit(&self, digest: &ContentDigest, origin_id: &str) -> Result<Option<ImageRecord>> {
        let _gate = self.gate_read()?;
        match self.store.record_hit(digest, Some(origin_id)) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First stored image the similarity engine accepts, closest first.
    ///
    /// Also returns the best score seen, for reporting on new images.
    /// Caller holds the gate shared.
    fn near_match(
        &self,
        decoded: &DynamicImage,
        signature: PerceptualSignature,
    ) -> Result<(Option<(ContentDigest, Verdict)>, f64)> {
        let candidates: Vec<(ContentDigest, PerceptualSignature)> = {
            let index = self.index_read()?;
            index
                .candidates(signature, self.similarity.candidate_radius())
                .into_iter()
                .filter_map(|c| index.signature_of(&c.digest).map(|s| (c.digest, s)))
                .collect()
        };

        let incoming = Comparand::from_image(decoded, signature);
        let mut best_score = 0.0f64;

        for (candidate, candidate_signature) in candidates {
            let verdict = match self.similarity.signature_verdict(signature, candidate_signature) {
                Some(verdict) => verdict,
                None => match self.structural_verdict(&incoming, &candidate, candidate_signature)? {
                    Some(verdict) => verdict,
                    None => continue,
                },
            };
            best_score = best_score.max(verdict.score);

            if verdict.is_duplicate {
                return Ok((Some((candidate, verdict)), best_score));
            }
        }
        Ok((None, best_score))
    }

    /// Load a candidate's payload and run the full comparison.
    ///
    /// `None` when the candidate vanished or can't be decoded.
    fn structural_verdict(
        &self,
        incoming: &Comparand<'_>,
        candidate: &ContentDigest,
        candidate_signature: PerceptualSignature,
    ) -> Result<Option<Verdict>> {
        let bytes = match self.store.peek(candidate) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored = Comparand::from_bytes(&bytes, candidate_signature);
        match self.similarity.is_duplicate(incoming, &stored) {
            Ok(verdict) => Ok(Some(verdict)),
            Err(e) => {
                tracing::warn!(digest = %candidate.short(), error = %e, "Skipping undecodable candidate");
                Ok(None)
            }
        }
    }

    /// Apply the near-duplicate policy; returns whether the copy was stored.
    ///
    /// Under `Persist` the copy is stored before the hit is counted, and
    /// taken out again if counting fails. Caller holds the gate shared.
    fn absorb_near_duplicate(
        &self,
        matched: ContentDigest,
        digest: ContentDigest,
        signature: PerceptualSignature,
        image: &IncomingImage,
    ) -> Result<bool> {
        match self.config.near_duplicate_policy {
            NearDuplicatePolicy::Discard => {
                self.store.record_hit(&matched, Some(&image.origin_id))?;
                Ok(false)
            }
            NearDuplicatePolicy::Persist => {
                let stored = self.insert_new(digest, signature, image)?;
                if let Err(e) = self.store.record_hit(&matched, None) {
                    if stored {
                        self.undo_insert(&digest);
                    }
                    return Err(e.into());
                }
                Ok(stored)
            }
        }
    }

    /// Store and index; returns whether anything new was written.
    fn insert_new(
        &self,
        digest: ContentDigest,
        signature: PerceptualSignature,
        image: &IncomingImage,
    ) -> Result<bool> {
        let metadata = RecordMetadata {
            perceptual_signature: signature,
            origin_id: image.origin_id.clone(),
        };
        if !self.store.put(&digest, &image.bytes, metadata)? {
            return Ok(false);
        }
        match self.index_write() {
            Ok(mut index) => {
                index.insert(signature, digest);
                Ok(true)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&digest) {
                    tracing::warn!(digest = %digest.short(), error = %cleanup, "Could not remove unindexed record");
                }
                Err(e)
            }
        }
    }

    fn undo_insert(&self, digest: &ContentDigest) {
        match self.index_write() {
            Ok(mut index) => {
                index.remove(digest);
            }
            Err(e) => {
                tracing::warn!(digest = %digest.short(), error = %e, "Could not unindex record");
            }
        }
        if let Err(e) = self.store.remove(digest) {
            tracing::warn!(digest = %digest.short(), error = %e, "Could not remove record");
        }
    }

    /// Eviction pass after a committed put; returns what was evicted
    fn evict_after_put(&self) -> Vec<ContentDigest> {
        match self.enforce_budget() {
            Ok(summary) => summary.evicted,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    total_bytes = self.store.total_size(),
                    budget = self.eviction.budget_bytes(),
                    "Eviction pass failed, store may stay over budget until the next one"
                );
                Vec::new()
            }
        }
    }

    fn enforce_budget(&self) -> Result<EvictionSummary> {
        if self.store.total_size() <= self.eviction.budget_bytes() {
            return Ok(EvictionSummary {
                total_bytes: self.store.total_size(),
                ..EvictionSummary::default()
            });
        }
        let _gate = self.gate_write()?;
        let mut index = self.index_write()?;
        let protected = self.claims.snapshot();
        Ok(self
            .eviction
            .maybe_evict(self.store.as_ref(), &mut index, &protected)?)
    }

    /// Payload bytes for a stored digest; counts as an access
    pub fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>> {
        let _gate = self.gate_read()?;
        Ok(self.store.get(digest)?)
    }

    pub fn record(&self, digest: &ContentDigest) -> Result<Option<ImageRecord>> {
        Ok(self.store.record(digest)?)
    }

    /// The stored record the latest submission from `origin_id` resolved
    /// to, if it is still cached
    pub fn lookup_origin(&self, origin_id: &str) -> Result<Option<ImageRecord>> {
        Ok(self.store.lookup_origin(origin_id)?)
    }

    /// Snapshot of every record, oldest first
    pub fn records(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.store.records()?)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let store_stats = self.store.stats()?;
        Ok(CacheStats {
            total_bytes: store_stats.total_bytes,
            entry_count: store_stats.entry_count,
            duplicate_count: store_stats.duplicate_count,
            budget_bytes: self.eviction.budget_bytes(),
            oldest_entry: store_stats.oldest_entry,
            newest_entry: store_stats.newest_entry,
        })
    }

    /// Evict every record stored more than `max_age` ago.
    ///
    /// An age reaching past the earliest representable time expires nothing.
    pub fn expire_older_than(&self, max_age: chrono::Duration) -> Result<EvictionSummary> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            tracing::debug!(days = max_age.num_days(), "Expiry age out of range, nothing to expire");
            return Ok(EvictionSummary {
                total_bytes: self.store.total_size(),
                ..EvictionSummary::default()
            });
        };
        let _gate = self.gate_write()?;
        let mut index = self.index_write()?;
        let protected = self.claims.snapshot();
        Ok(self
            .eviction
            .expire_before(self.store.as_ref(), &mut index, cutoff, &protected)?)
    }

    pub fn index_stats(&self) -> Result<IndexStats> {
        Ok(self.index_read()?.stats())
    }

    /// What the store had to repair when it was opened
    pub fn recovery_report(&self) -> RecoveryReport {
        self.store.recovery_report()
    }

    fn gate_read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate
            .read()
            .map_err(|_| CacheEngineError::from(IndexError::Poisoned))
    }

    fn gate_write(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.gate
            .write()
            .map_err(|_| CacheEngineError::from(IndexError::Poisoned))
    }

    fn index_read(&self) -> Result<RwLockReadGuard<'_, DuplicateIndex>> {
        self.index
            .read()
            .map_err(|_| CacheEngineError::from(IndexError::Poisoned))
    }

    fn index_write(&self) -> Result<RwLockWriteGuard<'_, DuplicateIndex>> {
        self.index
            .write()
            .map_err(|_| CacheEngineError::from(IndexError::Poisoned))
    }
}
