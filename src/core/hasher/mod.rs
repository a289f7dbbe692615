//! # Hasher Module
//!
//! Turns raw image bytes into the two fingerprints the cache keys on.
//!
//! ## Fingerprints
//! - **Content digest** - SHA-256 of the exact bytes; identity in the store
//! - **Perceptual signature** - 64-bit dHash; tolerant of re-encoding,
//!   exposure changes and small shifts
//!
//! ## How It Works
//! 1. Decode the bytes (zune-jpeg for JPEG, image crate otherwise)
//! 2. Convert to grayscale and shrink to a 9x8 grid
//! 3. Compare horizontal neighbours to get 64 bits
//! 4. Hash the raw bytes for the content digest
//!
//! Decoding happens before the digest is reported, so bytes that are not an
//! image never produce a fingerprint.
//!
//! ## Example
//! ```rust,ignore
//! use receipt_cache::core::hasher::ContentHasher;
//!
//! let fingerprint = ContentHasher::fingerprint(&bytes)?;
//! println!("{} {}", fingerprint.content_digest, fingerprint.perceptual_signature);
//! ```

mod difference;
pub mod fast_decode;
pub mod fast_resize;
mod types;

pub use difference::DifferenceHasher;
pub use fast_decode::FastDecoder;
pub use fast_resize::FastResizer;
pub use types::{ContentDigest, Fingerprint, ParseDigestError, PerceptualSignature, SIGNATURE_BITS};

use crate::error::HashError;
use image::DynamicImage;
use sha2::{Digest, Sha256};

/// Pure fingerprinting functions; no state, no side effects
pub struct ContentHasher;

impl ContentHasher {
    /// Compute both fingerprints of a payload.
    ///
    /// Fails with [`HashError::Decode`] when the bytes are not a supported image.
    pub fn fingerprint(bytes: &[u8]) -> Result<Fingerprint, HashError> {
        let image = FastDecoder::decode(bytes)?;
        Self::fingerprint_decoded(bytes, &image)
    }

    /// Fingerprint when the caller already decoded the payload
    pub fn fingerprint_decoded(bytes: &[u8], image: &DynamicImage) -> Result<Fingerprint, HashError> {
        Ok(Fingerprint {
            content_digest: Self::digest(bytes),
            perceptual_signature: DifferenceHasher::signature(image)?,
        })
    }

    /// SHA-256 of the raw bytes, no decoding
    pub fn digest(bytes: &[u8]) -> ContentDigest {
        ContentDigest::from_bytes(Sha256::digest(bytes).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes(seed: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 48, |x, y| {
            let v = ((x * 7 + y * 13 + seed * 31) % 251) as u8;
            Rgb([v, v / 2, 255 - v])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let bytes = png_bytes(3);
        let first = ContentHasher::fingerprint(&bytes).unwrap();
        let second = ContentHasher::fingerprint(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn digest_matches_known_sha256() {
        let digest = ContentHasher::digest(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_bytes_give_different_digests() {
        let a = ContentHasher::fingerprint(&png_bytes(1)).unwrap();
        let b = ContentHasher::fingerprint(&png_bytes(2)).unwrap();
        assert_ne!(a.content_digest, b.content_digest);
    }

    #[test]
    fn undecodable_bytes_fail() {
        let result = ContentHasher::fingerprint(b"%PDF-1.7 not an image");
        assert!(matches!(result, Err(HashError::Decode { .. })));
    }
}
