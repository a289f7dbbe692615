//! # Error Module
//!
//! Error types for the receipt image cache.
//!
//! ## Design Principles
//! - **Never panic** on caller data - return errors instead
//! - **Include context** - paths, digests, what went wrong
//! - **Per-image vs. systemic** - decode and oversize failures only affect
//!   the image being submitted, storage failures are the caller's call
//! - **Recovery hints** - suggest how to fix when possible

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for every cache operation
#[derive(Error, Debug)]
pub enum CacheEngineError {
    #[error("Hashing error: {0}")]
    Hash(#[from] HashError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "Image of {size_bytes} bytes exceeds the whole cache budget of {budget_bytes} bytes. \
         Raise max_cache_size_bytes or skip this image."
    )]
    OversizedImage { size_bytes: u64, budget_bytes: u64 },
}

impl CacheEngineError {
    /// True for failures that only concern the submitted image.
    ///
    /// Callers log these and move on to the next image; anything else is a
    /// storage or configuration problem they must decide to retry or abort.
    pub fn is_per_image(&self) -> bool {
        matches!(
            self,
            CacheEngineError::Hash(_) | CacheEngineError::OversizedImage { .. }
        )
    }
}

/// Errors that occur while fingerprinting or decoding image bytes
#[derive(Error, Debug)]
pub enum HashError {
    #[error("Failed to decode image: {reason}")]
    Decode { reason: String },

    #[error("Image is empty or has zero dimensions")]
    EmptyImage,

    #[error("Resize failed: {0}")]
    Resize(String),
}

/// Errors raised by the content-addressed store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No cached image with digest {digest}")]
    NotFound { digest: String },

    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata database query failed: {0}")]
    Database(String),

    #[error("Store state at {path} is unusable (a lock was poisoned). Restart the process.")]
    Corrupted { path: PathBuf },
}

impl StoreError {
    /// True when the digest simply isn't cached, as opposed to a failed read.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::Database(error.to_string())
    }
}

/// Errors concerning the persisted metadata index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Metadata index at {path} is unreadable: {reason}. It will be rebuilt from stored images.")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Duplicate index lock was poisoned")]
    Poisoned,
}

/// Errors in cache configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { field: &'static str, value: f64 },

    #[error("perceptual_low_threshold ({low}) must not exceed perceptual_high_threshold ({high})")]
    InvertedBand { low: f64, high: f64 },

    #[error("max_cache_size_bytes must be positive")]
    ZeroBudget,

    #[error("index_bands must be one of 1, 2, 4, 8, 16, got {0}")]
    InvalidBands(usize),

    #[error("normalized_resolution must be at least 8, got {0}")]
    ResolutionTooSmall(u32),

    #[error("Failed to read config file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, CacheEngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_error_suggests_recovery() {
        let error = CacheEngineError::OversizedImage {
            size_bytes: 2048,
            budget_bytes: 1024,
        };
        let message = error.to_string();
        assert!(message.contains("2048"));
        assert!(message.contains("max_cache_size_bytes"));
    }

    #[test]
    fn decode_and_oversize_are_per_image() {
        let decode: CacheEngineError = HashError::Decode {
            reason: "not an image".to_string(),
        }
        .into();
        assert!(decode.is_per_image());

        let oversized = CacheEngineError::OversizedImage {
            size_bytes: 10,
            budget_bytes: 5,
        };
        assert!(oversized.is_per_image());

        let io: CacheEngineError = StoreError::Io {
            path: PathBuf::from("/cache/objects/ab"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
        .into();
        assert!(!io.is_per_image());
    }

    #[test]
    fn not_found_is_distinguished_from_io() {
        let missing = StoreError::NotFound {
            digest: "abcd".to_string(),
        };
        assert!(missing.is_not_found());

        let io = StoreError::Io {
            path: PathBuf::from("/cache"),
            source: std::io::Error::other("disk full"),
        };
        assert!(!io.is_not_found());
        assert!(io.to_string().contains("/cache"));
    }

    #[test]
    fn corruption_mentions_rebuild() {
        let error = IndexError::Corrupted {
            path: PathBuf::from("/cache/index.db"),
            reason: "file is not a database".to_string(),
        };
        assert!(error.to_string().contains("rebuilt"));
    }
}
