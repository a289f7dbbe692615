//! # Duplicate Index
//!
//! Finds every cached image whose signature is within a Hamming radius of a
//! query, without comparing against the whole cache.
//!
//! ## How It Works
//! 1. Split each 64-bit signature into `bands` equal bands (8 bands = 8 bits each)
//! 2. Each band has a table: band value -> digests
//! 3. Pigeonhole: if two signatures differ in at most `d` bits, some band
//!    differs in at most `d / bands` bits
//! 4. A query probes, per band, every band value within that radius, then
//!    filters by true distance
//!
//! ## Guarantees
//! - No false negatives: everything within `max_distance` is returned
//! - No false positives either, since the final filter uses exact distance
//! - When probing would touch more buckets than there are entries, the
//!   index scans linearly instead; the result is identical

use crate::core::hasher::{ContentDigest, PerceptualSignature, SIGNATURE_BITS};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Band counts that split 64 bits evenly
pub const VALID_BANDS: [usize; 5] = [1, 2, 4, 8, 16];

/// A digest returned by a candidate lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub digest: ContentDigest,
    /// Hamming distance to the query
    pub distance: u32,
}

/// Banded multi-index over perceptual signatures
#[derive(Debug)]
pub struct DuplicateIndex {
    bands: usize,
    bits_per_band: u32,
    /// band index -> (band value -> digests)
    band_tables: Vec<HashMap<u64, Vec<ContentDigest>>>,
    signatures: HashMap<ContentDigest, PerceptualSignature>,
}

impl DuplicateIndex {
    pub fn new(bands: usize) -> Result<Self, ConfigError> {
        if !VALID_BANDS.contains(&bands) {
            return Err(ConfigError::InvalidBands(bands));
        }
        Ok(Self {
            bands,
            bits_per_band: SIGNATURE_BITS / bands as u32,
            band_tables: (0..bands).map(|_| HashMap::new()).collect(),
            signatures: HashMap::new(),
        })
    }

    /// Build an index from persisted (signature, digest) pairs
    pub fn build(
        bands: usize,
        entries: impl IntoIterator<Item = (PerceptualSignature, ContentDigest)>,
    ) -> Result<Self, ConfigError> {
        let mut index = Self::new(bands)?;
        for (signature, digest) in entries {
            index.insert(signature, digest);
        }
        Ok(index)
    }

    pub fn insert(&mut self, signature: PerceptualSignature, digest: ContentDigest) {
        match self.signatures.get(&digest) {
            Some(existing) if *existing == signature => return,
            Some(_) => {
                self.remove(&digest);
            }
            None => {}
        }

        for band in 0..self.bands {
            let value = self.band_value(signature, band);
            self.band_tables[band].entry(value).or_default().push(digest);
        }
        self.signatures.insert(digest, signature);
    }

    /// Drop a digest from every band; returns its signature if it was present
    pub fn remove(&mut self, digest: &ContentDigest) -> Option<PerceptualSignature> {
        let signature = self.signatures.remove(digest)?;
        for band in 0..self.bands {
            let value = self.band_value(signature, band);
            let table = &mut self.band_tables[band];
            if let Some(bucket) = table.get_mut(&value) {
                bucket.retain(|d| d != digest);
                if bucket.is_empty() {
                    table.remove(&value);
                }
            }
        }
        Some(signature)
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.signatures.contains_key(digest)
    }

    pub fn signature_of(&self, digest: &ContentDigest) -> Option<PerceptualSignature> {
        self.signatures.get(digest).copied()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Every indexed digest within `max_distance` bits, closest first
    pub fn candidates(&self, signature: PerceptualSignature, max_distance: u32) -> Vec<Candidate> {
        if self.signatures.is_empty() {
            return Vec::new();
        }

        let radius = max_distance / self.bands as u32;
        let probes = self
            .probes_per_band(radius)
            .saturating_mul(self.bands as u64);

        let mut found: Vec<Candidate> = if radius >= self.bits_per_band
            || probes > self.signatures.len() as u64
        {
            self.linear_scan(signature, max_distance)
        } else {
            self.probe(signature, radius, max_distance)
        };

        found.sort_by(|a, b| a.distance.cmp(&b.distance).then(a.digest.cmp(&b.digest)));
        found
    }

    fn probe(&self, signature: PerceptualSignature, radius: u32, max_distance: u32) -> Vec<Candidate> {
        let mut seen: HashSet<ContentDigest> = HashSet::new();
        let mut found = Vec::new();

        for band in 0..self.bands {
            let value = self.band_value(signature, band);
            for neighbour in band_neighbours(value, self.bits_per_band, radius) {
                let Some(bucket) = self.band_tables[band].get(&neighbour) else {
                    continue;
                };
                for digest in bucket {
                    if !seen.insert(*digest) {
                        continue;
                    }
                    if let Some(candidate) = self.check(signature, digest, max_distance) {
                        found.push(candidate);
                    }
                }
            }
        }
        found
    }

    fn linear_scan(&self, signature: PerceptualSignature, max_distance: u32) -> Vec<Candidate> {
        self.signatures
            .keys()
            .filter_map(|digest| self.check(signature, digest, max_distance))
            .collect()
    }

    fn check(
        &self,
        signature: PerceptualSignature,
        digest: &ContentDigest,
        max_distance: u32,
    ) -> Option<Candidate> {
        let stored = self.signatures.get(digest)?;
        let distance = stored.distance(&signature);
        (distance <= max_distance).then_some(Candidate {
            digest: *digest,
            distance,
        })
    }

    /// Bits `[band * width, (band + 1) * width)` counted from the top
    fn band_value(&self, signature: PerceptualSignature, band: usize) -> u64 {
        let width = self.bits_per_band;
        let shift = SIGNATURE_BITS - (band as u32 + 1) * width;
        let mask = if width == SIGNATURE_BITS {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        (signature.bits() >> shift) & mask
    }

    /// Σ C(width, k) for k in 0..=radius, saturating
    fn probes_per_band(&self, radius: u32) -> u64 {
        let n = self.bits_per_band as u64;
        let mut total: u64 = 0;
        let mut binomial: u64 = 1;
        for k in 0..=radius.min(self.bits_per_band) as u64 {
            if k > 0 {
                binomial = binomial.saturating_mul(n - k + 1) / k;
            }
            total = total.saturating_add(binomial);
        }
        total
    }

    pub fn stats(&self) -> IndexStats {
        let total_buckets: usize = self.band_tables.iter().map(|t| t.len()).sum();
        let max_bucket_size = self
            .band_tables
            .iter()
            .flat_map(|t| t.values())
            .map(|v| v.len())
            .max()
            .unwrap_or(0);

        IndexStats {
            entries: self.signatures.len(),
            bands: self.bands,
            bits_per_band: self.bits_per_band,
            total_buckets,
            max_bucket_size,
        }
    }
}

/// All values within `radius` bit flips of `value`, in a `width`-bit space
fn band_neighbours(value: u64, width: u32, radius: u32) -> Vec<u64> {
    fn flip(value: u64, width: u32, remaining: u32, start: u32, out: &mut Vec<u64>) {
        for bit in start..width {
            let next = value ^ (1u64 << bit);
            out.push(next);
            if remaining > 1 {
                flip(next, width, remaining - 1, bit + 1, out);
            }
        }
    }

    let mut out = vec![value];
    if radius > 0 {
        flip(value, width, radius, 0, &mut out);
    }
    out
}

/// Shape of the index, for logs and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub entries: usize,
    pub bands: usize,
    pub bits_per_band: u32,
    pub total_buckets: usize,
    pub max_bucket_size: usize,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Duplicate index: {} signatures, {} bands ({} bits each), {} buckets (largest {})",
            self.entries, self.bands, self.bits_per_band, self.total_buckets, self.max_bucket_size
        )
    }
}
