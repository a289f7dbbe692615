//! # Receipt Cache
//!
//! Image cache and duplicate detection for receipt scanning.
//!
//! Every incoming image is fingerprinted and resolved to one of three
//! outcomes: new, byte-identical to something cached, or visually the same
//! receipt as something cached. New images are stored under a byte budget
//! with LRU eviction.
//!
//! ## Architecture
//! - `core` - Hashing, similarity, the duplicate index, storage, eviction and
//!   the coordinator that ties them together
//! - `config` - Layered cache configuration
//! - `events` - Channel-based activity reporting
//! - `error` - Error types with recovery hints

pub mod config;
pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use config::{CacheConfig, NearDuplicatePolicy};
pub use core::{CacheCoordinator, CacheStats, Decision, IncomingImage, Outcome};
pub use error::{CacheEngineError, Result};

/// Initialize tracing for the library
///
/// Called by the application entry point. Honours `RUST_LOG` and falls back
/// to `warn`; output goes to stderr so it never mixes with JSON on stdout.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
