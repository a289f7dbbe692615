//! # Config Module
//!
//! Cache configuration, layered from several sources (later wins):
//!
//! 1. Built-in defaults
//! 2. A JSON file ([`CacheConfig::from_json_file`])
//! 3. Environment variables ([`CacheConfig::with_env_overrides`])
//! 4. Whatever the caller sets explicitly (CLI flags, builder setters)
//!
//! Nothing is checked until [`CacheConfig::validate`], which the
//! coordinator calls when it opens.
//!
//! ## Example
//! ```rust,ignore
//! let config = CacheConfig::from_json_file(Path::new("cache.json"))?
//!     .with_env_overrides()?
//!     .max_cache_size_bytes(512 * 1024 * 1024);
//! config.validate()?;
//! ```

use crate::core::index::VALID_BANDS;
use crate::core::similarity::SimilarityConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `cache_directory`
pub const ENV_CACHE_DIR: &str = "RECEIPT_CACHE_DIR";
/// Overrides `max_cache_size_bytes`
pub const ENV_MAX_BYTES: &str = "RECEIPT_CACHE_MAX_BYTES";
/// Overrides `duplicate_threshold`
pub const ENV_DUPLICATE_THRESHOLD: &str = "RECEIPT_DUPLICATE_THRESHOLD";

const MIB: u64 = 1024 * 1024;
const MIN_RESOLUTION: u32 = 8;

/// What to do with an image judged a near duplicate of a stored one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NearDuplicatePolicy {
    /// Count the hit against the matched record, keep nothing new
    #[default]
    Discard,
    /// Also store the near duplicate as its own record
    Persist,
}

/// Configuration for the receipt cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for payloads and the metadata database
    pub cache_directory: PathBuf,
    /// Byte budget enforced by eviction
    pub max_cache_size_bytes: u64,
    /// Minimum structural score for a near duplicate
    pub duplicate_threshold: f64,
    /// Normalized Hamming distance below which images are duplicates outright
    pub perceptual_low_threshold: f64,
    /// Normalized Hamming distance above which images are never duplicates
    pub perceptual_high_threshold: f64,
    pub near_duplicate_policy: NearDuplicatePolicy,
    /// Band count of the duplicate index (1, 2, 4, 8 or 16)
    pub index_bands: usize,
    /// Side length images are normalized to before structural comparison
    pub normalized_resolution: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let similarity = SimilarityConfig::default();
        Self {
            cache_directory: default_cache_directory(),
            max_cache_size_bytes: 1000 * MIB,
            duplicate_threshold: similarity.duplicate_threshold,
            perceptual_low_threshold: similarity.perceptual_low_threshold,
            perceptual_high_threshold: similarity.perceptual_high_threshold,
            near_duplicate_policy: NearDuplicatePolicy::default(),
            index_bands: 8,
            normalized_resolution: similarity.normalized_resolution,
        }
    }
}

/// Platform cache dir (e.g. `~/.cache/receipt-cache`), or the temp dir when
/// the platform has none
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("receipt-cache")
}

impl CacheConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))
    }

    /// Apply `RECEIPT_CACHE_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_directory = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_BYTES) {
            self.max_cache_size_bytes =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_MAX_BYTES,
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup(ENV_DUPLICATE_THRESHOLD) {
            self.duplicate_threshold =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_DUPLICATE_THRESHOLD,
                    value: value.clone(),
                })?;
        }
        Ok(self)
    }

    pub fn cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = dir.into();
        self
    }

    pub fn max_cache_size_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = bytes;
        self
    }

    pub fn duplicate_threshold(mut self, threshold: f64) -> Self {
        self.duplicate_threshold = threshold;
        self
    }

    /// Set both bounds of the ambiguous band
    pub fn perceptual_thresholds(mut self, low: f64, high: f64) -> Self {
        self.perceptual_low_threshold = low;
        self.perceptual_high_threshold = high;
        self
    }

    pub fn near_duplicate_policy(mut self, policy: NearDuplicatePolicy) -> Self {
        self.near_duplicate_policy = policy;
        self
    }

    pub fn index_bands(mut self, bands: usize) -> Self {
        self.index_bands = bands;
        self
    }

    pub fn normalized_resolution(mut self, resolution: u32) -> Self {
        self.normalized_resolution = resolution;
        self
    }

    /// Check every field; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size_bytes == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        for (field, value) in [
            ("duplicate_threshold", self.duplicate_threshold),
            ("perceptual_low_threshold", self.perceptual_low_threshold),
            ("perceptual_high_threshold", self.perceptual_high_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { field, value });
            }
        }
        if self.perceptual_low_threshold > self.perceptual_high_threshold {
            return Err(ConfigError::InvertedBand {
                low: self.perceptual_low_threshold,
                high: self.perceptual_high_threshold,
            });
        }
        if !VALID_BANDS.contains(&self.index_bands) {
            return Err(ConfigError::InvalidBands(self.index_bands));
        }
        if self.normalized_resolution < MIN_RESOLUTION {
            return Err(ConfigError::ResolutionTooSmall(self.normalized_resolution));
        }
        Ok(())
    }

    /// The thresholds the similarity engine needs
    pub fn similarity(&self) -> SimilarityConfig {
        SimilarityConfig {
            perceptual_low_threshold: self.perceptual_low_threshold,
            perceptual_high_threshold: self.perceptual_high_threshold,
            duplicate_threshold: self.duplicate_threshold,
            normalized_resolution: self.normalized_resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_cache_size_bytes, 1000 * MIB);
        assert_eq!(config.near_duplicate_policy, NearDuplicatePolicy::Discard);
        assert!(config.cache_directory.ends_with("receipt-cache"));
    }

    #[test]
    fn json_file_overrides_only_given_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{ "max_cache_size_bytes": 2048, "near_duplicate_policy": "persist" }"#,
        )
        .unwrap();

        let config = CacheConfig::from_json_file(&path).unwrap();

        assert_eq!(config.max_cache_size_bytes, 2048);
        assert_eq!(config.near_duplicate_policy, NearDuplicatePolicy::Persist);
        assert_eq!(config.duplicate_threshold, 0.95);
        assert_eq!(config.index_bands, 8);
    }

    #[test]
    fn unreadable_json_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let error = CacheConfig::from_json_file(&path).unwrap_err();
        assert!(error.to_string().contains("broken.json"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_CACHE_DIR, "/var/cache/receipts"),
            (ENV_MAX_BYTES, "4096"),
            (ENV_DUPLICATE_THRESHOLD, "0.9"),
        ]
        .into_iter()
        .collect();

        let config = CacheConfig::default()
            .with_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cache_directory, PathBuf::from("/var/cache/receipts"));
        assert_eq!(config.max_cache_size_bytes, 4096);
        assert_eq!(config.duplicate_threshold, 0.9);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let error = CacheConfig::default()
            .with_overrides_from(|name| (name == ENV_MAX_BYTES).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidEnv { name: ENV_MAX_BYTES, .. }));
    }

    #[test]
    fn validate_catches_each_rule() {
        let base = CacheConfig::default();

        assert!(matches!(
            base.clone().max_cache_size_bytes(0).validate(),
            Err(ConfigError::ZeroBudget)
        ));
        assert!(matches!(
            base.clone().duplicate_threshold(1.5).validate(),
            Err(ConfigError::ThresholdOutOfRange { field: "duplicate_threshold", .. })
        ));
        assert!(matches!(
            base.clone().perceptual_thresholds(0.4, 0.2).validate(),
            Err(ConfigError::InvertedBand { .. })
        ));
        assert!(matches!(
            base.clone().index_bands(3).validate(),
            Err(ConfigError::InvalidBands(3))
        ));
        assert!(matches!(
            base.normalized_resolution(4).validate(),
            Err(ConfigError::ResolutionTooSmall(4))
        ));
    }

    #[test]
    fn similarity_carries_thresholds() {
        let config = CacheConfig::default()
            .perceptual_thresholds(0.1, 0.2)
            .duplicate_threshold(0.8)
            .normalized_resolution(64);
        let similarity = config.similarity();
        assert_eq!(similarity.perceptual_low_threshold, 0.1);
        assert_eq!(similarity.perceptual_high_threshold, 0.2);
        assert_eq!(similarity.duplicate_threshold, 0.8);
        assert_eq!(similarity.normalized_resolution, 64);
    }
}
