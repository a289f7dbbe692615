//! Parallel batch submission.

use super::{CacheCoordinator, Decision, IncomingImage, Outcome};
use crate::error::Result;
use crate::events::{BatchEvent, BatchProgress, BatchSummary, Event};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Per-image results, in submission order, plus totals
#[derive(Debug)]
pub struct BatchResult {
    pub results: Vec<Result<Decision>>,
    pub summary: BatchSummary,
}

impl CacheCoordinator {
    /// Submit many images in parallel.
    ///
    /// Each image goes through [`submit`](Self::submit) on the rayon pool; a
    /// failure only affects its own slot in `results`.
    pub fn submit_batch(&self, images: Vec<IncomingImage>) -> BatchResult {
        let start_time = Instant::now();
        let total = images.len();
        self.events
            .send(Event::Batch(BatchEvent::Started { total_images: total }));

        let completed = AtomicUsize::new(0);
        let results: Vec<Result<Decision>> = images
            .into_par_iter()
            .map(|image| {
                let result = self.submit(image);
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                self.events
                    .send(Event::Batch(BatchEvent::Progress(BatchProgress { completed: done, total })));
                result
            })
            .collect();

        let mut summary = summarize(&results);
        summary.duration_ms = start_time.elapsed().as_millis() as u64;

        tracing::info!(
            total = summary.total_images,
            new = summary.new_images,
            exact = summary.exact_duplicates,
            near = summary.near_duplicates,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Batch complete"
        );
        self.events.send(Event::Batch(BatchEvent::Completed {
            summary: summary.clone(),
        }));

        BatchResult { results, summary }
    }
}

fn summarize(results: &[Result<Decision>]) -> BatchSummary {
    let mut summary = BatchSummary {
        total_images: results.len(),
        ..BatchSummary::default()
    };
    for result in results {
        match result {
            Ok(decision) => {
                match decision.outcome {
                    Outcome::New => summary.new_images += 1,
                    Outcome::ExactDuplicate => summary.exact_duplicates += 1,
                    Outcome::NearDuplicate => summary.near_duplicates += 1,
                }
                summary.evicted += decision.evicted.len();
            }
            Err(_) => summary.failed += 1,
        }
    }
    summary
}
