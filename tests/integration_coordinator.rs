//! Integration tests for the cache coordinator on a real disk store.
//!
//! These tests verify end-to-end behavior including:
//! - Exact and near-duplicate detection
//! - Budget enforcement and LRU eviction
//! - Concurrent submissions of the same image
//! - Cold start, recovery and corruption handling

mod common;

use common::{receipt_jpeg, receipt_png};
use image::GrayImage;
use receipt_cache::core::hasher::ContentHasher;
use receipt_cache::core::similarity::StructuralMetric;
use receipt_cache::events::{Event, EventChannel, IndexEvent};
use receipt_cache::{CacheConfig, CacheCoordinator, CacheEngineError, IncomingImage, Outcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir) -> CacheConfig {
    CacheConfig::default().cache_directory(dir.path())
}

#[test]
fn fingerprint_is_deterministic() {
    let bytes = receipt_png(1, 0);

    let first = ContentHasher::fingerprint(&bytes).unwrap();
    let second = ContentHasher::fingerprint(&bytes).unwrap();

    assert_eq!(first, second);
}

#[test]
fn reencoded_image_keeps_a_close_signature() {
    let png = ContentHasher::fingerprint(&receipt_png(2, 0)).unwrap();
    let jpeg = ContentHasher::fingerprint(&receipt_jpeg(2)).unwrap();

    assert_ne!(png.content_digest, jpeg.content_digest);
    assert!(png.perceptual_signature.distance(&jpeg.perceptual_signature) <= 6);
}

#[test]
fn exact_duplicate_keeps_one_record() {
    let dir = TempDir::new().unwrap();
    let cache = CacheCoordinator::open(config(&dir)).unwrap();
    let bytes = receipt_png(3, 0);

    let first = cache.submit(IncomingImage::new(bytes.clone(), "drive:a")).unwrap();
    let second = cache.submit(IncomingImage::new(bytes, "drive:b")).unwrap();

    assert_eq!(first.outcome, Outcome::New);
    assert_eq!(second.outcome, Outcome::ExactDuplicate);
    assert_eq!(second.score, 1.0);

    let records = cache.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ref_count, 2);
    assert_eq!(records[0].origin_id, "drive:a");
}

#[test]
fn brightened_variant_is_a_near_duplicate() {
    let dir = TempDir::new().unwrap();
    let cache = CacheCoordinator::open(config(&dir)).unwrap();

    let original = cache.submit(IncomingImage::new(receipt_png(4, 0), "scan")).unwrap();
    let variant = cache.submit(IncomingImage::new(receipt_png(4, 10), "photo")).unwrap();

    assert_eq!(variant.outcome, Outcome::NearDuplicate);
    assert_eq!(variant.matched_digest, Some(original.content_digest));
    assert_ne!(variant.content_digest, original.content_digest);
    assert_eq!(cache.stats().unwrap().entry_count, 1);
}

#[test]
fn unrelated_images_are_both_new() {
    let dir = TempDir::new().unwrap();
    let cache = CacheCoordinator::open(config(&dir)).unwrap();

    let a = cache.submit(IncomingImage::new(receipt_png(5, 0), "a")).unwrap();
    let b = cache.submit(IncomingImage::new(receipt_png(6, 0), "b")).unwrap();

    assert_eq!(a.outcome, Outcome::New);
    assert_eq!(b.outcome, Outcome::New);
    assert_eq!(cache.stats().unwrap().entry_count, 2);
}

#[test]
fn budget_scenario_evicts_the_older_image() {
    let dir = TempDir::new().unwrap();
    let (a, b) = (receipt_png(7, 0), receipt_png(8, 0));
    let budget = a.len().max(b.len()) as u64;
    let cache = CacheCoordinator::open(config(&dir).max_cache_size_bytes(budget)).unwrap();

    let first = cache.submit(IncomingImage::new(a, "a")).unwrap();
    let second = cache.submit(IncomingImage::new(b.clone(), "b")).unwrap();

    assert_eq!(second.evicted, vec![first.content_digest]);
    let stats = cache.stats().unwrap();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.total_bytes, b.len() as u64);
    assert!(stats.total_bytes <= stats.budget_bytes);

    match cache.get(&first.content_digest) {
        Err(CacheEngineError::Store(e)) => assert!(e.is_not_found()),
        other => panic!("expected NotFound, got {:?}", other.map(|b| b.len())),
    }
    assert_eq!(cache.get(&second.content_digest).unwrap(), b);
}

#[test]
fn recently_read_image_survives_eviction() {
    let dir = TempDir::new().unwrap();
    let images: Vec<Vec<u8>> = (10..13).map(|seed| receipt_png(seed, 0)).collect();
    let largest = images.iter().map(Vec::len).max().unwrap() as u64;
    let budget = largest * 2 + 1;
    let cache = CacheCoordinator::open(config(&dir).max_cache_size_bytes(budget)).unwrap();

    let first = cache.submit(IncomingImage::new(images[0].clone(), "0")).unwrap();
    let second = cache.submit(IncomingImage::new(images[1].clone(), "1")).unwrap();
    cache.get(&first.content_digest).unwrap();
    let third = cache.submit(IncomingImage::new(images[2].clone(), "2")).unwrap();

    assert_eq!(third.evicted, vec![second.content_digest]);
    assert!(cache.record(&first.content_digest).unwrap().is_some());
}

#[test]
fn oversized_image_is_rejected_without_state_change() {
    let dir = TempDir::new().unwrap();
    let bytes = receipt_png(13, 0);
    let cache =
        CacheCoordinator::open(config(&dir).max_cache_size_bytes(bytes.len() as u64 - 1)).unwrap();

    let error = cache.submit(IncomingImage::new(bytes, "big")).unwrap_err();

    assert!(matches!(error, CacheEngineError::OversizedImage { .. }));
    assert!(error.is_per_image());
    assert_eq!(cache.stats().unwrap().entry_count, 0);
}

#[test]
fn concurrent_identical_submissions_store_once() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(CacheCoordinator::open(config(&dir)).unwrap());
    let bytes = receipt_png(14, 0);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let bytes = bytes.clone();
            thread::spawn(move || {
                cache
                    .submit(IncomingImage::new(bytes, format!("worker-{}", i)))
                    .unwrap()
            })
        })
        .collect();
    let outcomes: Vec<Outcome> = handles
        .into_iter()
        .map(|h| h.join().unwrap().outcome)
        .collect();

    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::New).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == Outcome::ExactDuplicate)
            .count(),
        7
    );
    let records = cache.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ref_count, 8);
}

struct CountingMetric(Arc<AtomicUsize>);

impl StructuralMetric for CountingMetric {
    fn score(&self, _a: &GrayImage, _b: &GrayImage) -> f64 {
        self.0.fetch_add(1, Ordering::SeqCst);
        1.0
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[test]
fn perceptual_tier_never_runs_structural_metric() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = CacheCoordinator::builder(config(&dir))
        .metric(Box::new(CountingMetric(Arc::clone(&calls))))
        .open()
        .unwrap();

    cache.submit(IncomingImage::new(receipt_png(15, 0), "a")).unwrap();
    let variant = cache.submit(IncomingImage::new(receipt_png(15, 10), "b")).unwrap();

    assert_eq!(variant.outcome, Outcome::NearDuplicate);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn cold_start_rebuilds_index_from_metadata() {
    let dir = TempDir::new().unwrap();
    let original = {
        let cache = CacheCoordinator::open(config(&dir)).unwrap();
        cache.submit(IncomingImage::new(receipt_png(16, 0), "scan")).unwrap()
    };

    let (sender, receiver) = EventChannel::new();
    let cache = CacheCoordinator::builder(config(&dir))
        .events(sender)
        .open()
        .unwrap();

    assert!(matches!(
        receiver.try_recv(),
        Some(Event::Index(IndexEvent::Rebuilt { entries: 1, .. }))
    ));
    assert_eq!(cache.index_stats().unwrap().entries, 1);

    let exact = cache.submit(IncomingImage::new(receipt_png(16, 0), "again")).unwrap();
    assert_eq!(exact.outcome, Outcome::ExactDuplicate);

    let near = cache.submit(IncomingImage::new(receipt_png(16, 10), "photo")).unwrap();
    assert_eq!(near.outcome, Outcome::NearDuplicate);
    assert_eq!(near.matched_digest, Some(original.content_digest));
}

#[test]
fn corrupt_metadata_is_rebuilt_and_reported() {
    let dir = TempDir::new().unwrap();
    let bytes = receipt_png(17, 0);
    let original = {
        let cache = CacheCoordinator::open(config(&dir)).unwrap();
        cache.submit(IncomingImage::new(bytes.clone(), "scan")).unwrap()
    };
    for name in ["index.db", "index.db-wal", "index.db-shm"] {
        let _ = std::fs::remove_file(dir.path().join(name));
    }
    std::fs::write(
        dir.path().join("index.db"),
        b"this is not a sqlite database at all, not even close",
    )
    .unwrap();

    let (sender, receiver) = EventChannel::new();
    let cache = CacheCoordinator::builder(config(&dir))
        .events(sender)
        .open()
        .unwrap();

    let recovered = receiver.drain().into_iter().any(|event| {
        matches!(
            event,
            Event::Index(IndexEvent::CorruptionRecovered { recovered_payloads: 1, .. })
        )
    });
    assert!(recovered);
    assert_eq!(cache.get(&original.content_digest).unwrap(), bytes);

    let again = cache.submit(IncomingImage::new(bytes, "again")).unwrap();
    assert_eq!(again.outcome, Outcome::ExactDuplicate);
}

#[test]
fn shrinking_the_budget_evicts_on_open() {
    let dir = TempDir::new().unwrap();
    let (a, b) = (receipt_png(18, 0), receipt_png(19, 0));
    let second = {
        let cache = CacheCoordinator::open(config(&dir)).unwrap();
        cache.submit(IncomingImage::new(a, "a")).unwrap();
        cache.submit(IncomingImage::new(b.clone(), "b")).unwrap()
    };

    let cache =
        CacheCoordinator::open(config(&dir).max_cache_size_bytes(b.len() as u64)).unwrap();

    let records = cache.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content_digest, second.content_digest);
}

#[test]
fn structural_band_resolves_near_duplicates_through_the_cache() {
    let dir = TempDir::new().unwrap();
    // Every pair lands in the structural band
    let cache =
        CacheCoordinator::open(config(&dir).perceptual_thresholds(0.0, 1.0)).unwrap();

    let original = cache.submit(IncomingImage::new(receipt_png(22, 0), "scan")).unwrap();
    let variant = cache.submit(IncomingImage::new(receipt_png(22, 10), "photo")).unwrap();
    let unrelated = cache.submit(IncomingImage::new(receipt_png(23, 0), "other")).unwrap();

    assert_eq!(variant.outcome, Outcome::NearDuplicate);
    assert_eq!(variant.matched_digest, Some(original.content_digest));
    assert!(variant.score >= 0.95 && variant.score < 1.0, "score {}", variant.score);

    assert_eq!(unrelated.outcome, Outcome::New);
    assert_eq!(unrelated.matched_digest, None);
    assert!(unrelated.score < 0.95);
    assert_eq!(cache.stats().unwrap().entry_count, 2);
}

#[test]
fn origins_resolve_after_reopen() {
    let dir = TempDir::new().unwrap();
    let original = {
        let cache = CacheCoordinator::open(config(&dir)).unwrap();
        let original = cache.submit(IncomingImage::new(receipt_png(24, 0), "drive:a")).unwrap();
        cache.submit(IncomingImage::new(receipt_png(24, 0), "drive:b")).unwrap();
        cache.submit(IncomingImage::new(receipt_png(24, 10), "mail:c")).unwrap();
        original
    };

    let cache = CacheCoordinator::open(config(&dir)).unwrap();

    for origin in ["drive:a", "drive:b", "mail:c"] {
        let record = cache.lookup_origin(origin).unwrap().unwrap();
        assert_eq!(record.content_digest, original.content_digest, "{}", origin);
    }
    assert!(cache.lookup_origin("drive:z").unwrap().is_none());
}

#[test]
fn expiry_with_an_enormous_age_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let cache = CacheCoordinator::open(config(&dir)).unwrap();
    cache.submit(IncomingImage::new(receipt_png(25, 0), "scan")).unwrap();

    let summary = cache
        .expire_older_than(chrono::Duration::days(4_000_000_000))
        .unwrap();

    assert!(summary.is_empty());
    assert_eq!(cache.stats().unwrap().entry_count, 1);
}

#[test]
fn batch_submission_reports_every_image() {
    let dir = TempDir::new().unwrap();
    let cache = CacheCoordinator::open(config(&dir)).unwrap();
    let images = vec![
        IncomingImage::new(receipt_png(20, 0), "a"),
        IncomingImage::new(receipt_png(21, 0), "b"),
        IncomingImage::new(receipt_png(20, 0), "a-again"),
        IncomingImage::new(b"not an image".to_vec(), "junk"),
    ];

    let batch = cache.submit_batch(images);

    assert_eq!(batch.summary.total_images, 4);
    assert_eq!(batch.summary.new_images, 2);
    assert_eq!(batch.summary.exact_duplicates, 1);
    assert_eq!(batch.summary.failed, 1);
    assert!(batch.results[3].is_err());
    assert_eq!(cache.stats().unwrap().entry_count, 2);
}
