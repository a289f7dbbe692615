//! # Similarity Module
//!
//! Decides whether two images are the same receipt.
//!
//! ## Two-Tier Decision
//! | Normalized Hamming distance | Decision |
//! |----------------------------|----------|
//! | `< low`                    | Duplicate, no decoding |
//! | `low ..= high`             | Decode, normalize, run SSIM |
//! | `> high`                   | Not a duplicate, no decoding |
//!
//! Perceptual hashing is cheap but coarse; SSIM is accurate but needs full
//! pixel data. Only the ambiguous band pays for the expensive path.

mod ssim;

pub use ssim::WindowedSsim;

use crate::core::hasher::{FastDecoder, FastResizer, PerceptualSignature, SIGNATURE_BITS};
use crate::error::HashError;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;

/// Pluggable structural comparison over two equally sized grayscale images
pub trait StructuralMetric: Send + Sync {
    /// Similarity in `[0, 1]`, 1 = identical
    fn score(&self, a: &GrayImage, b: &GrayImage) -> f64;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Thresholds for the two-tier decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Below this normalized distance images are duplicates outright
    pub perceptual_low_threshold: f64,
    /// Above this normalized distance images are never duplicates
    pub perceptual_high_threshold: f64,
    /// Minimum structural score for a duplicate inside the band
    pub duplicate_threshold: f64,
    /// Side length of the common grid SSIM runs on
    pub normalized_resolution: u32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            perceptual_low_threshold: 0.05,
            perceptual_high_threshold: 0.30,
            duplicate_threshold: 0.95,
            normalized_resolution: 128,
        }
    }
}

/// Which tier produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTier {
    /// Signatures close enough to skip pixel comparison
    Perceptual,
    /// Ambiguous band resolved by structural similarity
    Structural,
    /// Signatures too far apart to bother
    Rejected,
}

impl std::fmt::Display for DecisionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionTier::Perceptual => write!(f, "perceptual"),
            DecisionTier::Structural => write!(f, "structural"),
            DecisionTier::Rejected => write!(f, "rejected"),
        }
    }
}

/// Outcome of comparing two images
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_duplicate: bool,
    /// Similarity in `[0, 1]`, 1 = identical
    pub score: f64,
    pub tier: DecisionTier,
}

/// One side of a comparison.
///
/// Pixels are decoded and normalized at most once, and only if the
/// structural tier actually needs them.
pub struct Comparand<'a> {
    source: Source<'a>,
    signature: PerceptualSignature,
    normalized: OnceCell<GrayImage>,
}

enum Source<'a> {
    Bytes(&'a [u8]),
    Decoded(&'a DynamicImage),
}

impl<'a> Comparand<'a> {
    /// Comparand backed by encoded bytes, decoded on demand
    pub fn from_bytes(bytes: &'a [u8], signature: PerceptualSignature) -> Self {
        Self {
            source: Source::Bytes(bytes),
            signature,
            normalized: OnceCell::new(),
        }
    }

    /// Comparand for an image the caller already decoded
    pub fn from_image(image: &'a DynamicImage, signature: PerceptualSignature) -> Self {
        Self {
            source: Source::Decoded(image),
            signature,
            normalized: OnceCell::new(),
        }
    }

    pub fn signature(&self) -> PerceptualSignature {
        self.signature
    }

    fn normalized(&self, resolution: u32) -> Result<&GrayImage, HashError> {
        if let Some(gray) = self.normalized.get() {
            return Ok(gray);
        }
        let gray = match self.source {
            Source::Bytes(bytes) => {
                let image = FastDecoder::decode(bytes)?;
                FastResizer::new().resize_to_grayscale(&image, resolution, resolution)?
            }
            Source::Decoded(image) => {
                FastResizer::new().resize_to_grayscale(image, resolution, resolution)?
            }
        };
        Ok(self.normalized.get_or_init(|| gray))
    }
}

/// Two-tier duplicate decision
pub struct SimilarityEngine {
    config: SimilarityConfig,
    metric: Box<dyn StructuralMetric>,
}

impl SimilarityEngine {
    /// Engine with windowed SSIM as the structural metric
    pub fn new(config: SimilarityConfig) -> Self {
        Self::with_metric(config, Box::new(WindowedSsim::default()))
    }

    pub fn with_metric(config: SimilarityConfig, metric: Box<dyn StructuralMetric>) -> Self {
        Self { config, metric }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// Largest Hamming distance that can still be a duplicate.
    ///
    /// Candidate lookups use this radius so nothing the structural tier
    /// could accept is filtered out beforehand.
    pub fn candidate_radius(&self) -> u32 {
        let bits = (self.config.perceptual_high_threshold * SIGNATURE_BITS as f64).ceil();
        (bits as u32).min(SIGNATURE_BITS)
    }

    /// Verdict from the signatures alone, `None` inside the structural band.
    ///
    /// Callers holding only signatures can skip loading pixels when this
    /// already decides.
    pub fn signature_verdict(
        &self,
        a: PerceptualSignature,
        b: PerceptualSignature,
    ) -> Option<Verdict> {
        let distance = a.normalized_distance(&b);
        if distance < self.config.perceptual_low_threshold {
            Some(Verdict {
                is_duplicate: true,
                score: 1.0 - distance,
                tier: DecisionTier::Perceptual,
            })
        } else if distance > self.config.perceptual_high_threshold {
            Some(Verdict {
                is_duplicate: false,
                score: 1.0 - distance,
                tier: DecisionTier::Rejected,
            })
        } else {
            None
        }
    }

    pub fn is_duplicate(&self, a: &Comparand<'_>, b: &Comparand<'_>) -> Result<Verdict, HashError> {
        if let Some(verdict) = self.signature_verdict(a.signature, b.signature) {
            return Ok(verdict);
        }
        let distance = a.signature.normalized_distance(&b.signature);

        let resolution = self.config.normalized_resolution;
        let score = self
            .metric
            .score(a.normalized(resolution)?, b.normalized(resolution)?)
            .clamp(0.0, 1.0);

        tracing::trace!(
            metric = self.metric.name(),
            hamming = distance,
            score,
            "structural comparison"
        );

        Ok(Verdict {
            is_duplicate: score >= self.config.duplicate_threshold,
            score,
            tier: DecisionTier::Structural,
        })
    }
}
