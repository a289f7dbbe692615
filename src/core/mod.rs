//! # Core Module
//!
//! The cache and duplicate detection engine.
//!
//! ## Modules
//! - `hasher` - Content digests and perceptual signatures
//! - `similarity` - Two-tier duplicate verdicts (Hamming, then SSIM)
//! - `index` - Banded lookup of near signatures
//! - `store` - Content-addressed payloads and metadata
//! - `eviction` - LRU budget enforcement
//! - `coordinator` - The submission entry point

pub mod coordinator;
pub mod eviction;
pub mod hasher;
pub mod index;
pub mod similarity;
pub mod store;

// Re-export commonly used types
pub use coordinator::{CacheCoordinator, CacheStats, Decision, IncomingImage, Outcome};
pub use hasher::{ContentDigest, Fingerprint, PerceptualSignature};
pub use store::ImageRecord;
