//! Per-digest claims for in-flight submissions.

use crate::core::hasher::ContentDigest;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Digests currently being processed.
///
/// A second submission of the same digest blocks in [`ClaimSet::claim`]
/// until the first one releases it. Claimed digests are also exempt from
/// eviction.
#[derive(Default)]
pub(crate) struct ClaimSet {
    claimed: Mutex<HashSet<ContentDigest>>,
    released: Condvar,
}

impl ClaimSet {
    // The set is only ever mutated by insert/remove, so a poisoned lock
    // still holds a consistent set.
    fn lock(&self) -> MutexGuard<'_, HashSet<ContentDigest>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `digest` is free, then hold it until the guard drops
    pub fn claim(&self, digest: ContentDigest) -> ClaimGuard<'_> {
        let mut claimed = self.lock();
        while claimed.contains(&digest) {
            claimed = self
                .released
                .wait(claimed)
                .unwrap_or_else(|e| e.into_inner());
        }
        claimed.insert(digest);
        ClaimGuard { set: self, digest }
    }

    pub fn snapshot(&self) -> HashSet<ContentDigest> {
        self.lock().clone()
    }

    fn release(&self, digest: &ContentDigest) {
        self.lock().remove(digest);
        self.released.notify_all();
    }
}

/// Releases its claim on drop, including on early returns and errors
pub(crate) struct ClaimGuard<'a> {
    set: &'a ClaimSet,
    digest: ContentDigest,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.set.release(&self.digest);
    }
}
