//! Difference hash (dHash) signatures.
//!
//! dHash works by:
//! 1. Resizing the image to 9x8 luminance cells
//! 2. Comparing each cell to the one to its right
//! 3. Setting the bit when the left cell is brighter
//!
//! This captures the gradient structure of the picture, so re-photographing
//! the same receipt under different exposure keeps most bits unchanged.

use super::fast_resize::FastResizer;
use super::types::PerceptualSignature;
use crate::error::HashError;
use image::{DynamicImage, GrayImage};

const GRID_WIDTH: u32 = 9;
const GRID_HEIGHT: u32 = 8;

/// Computes 64-bit difference-hash signatures
pub struct DifferenceHasher;

impl DifferenceHasher {
    pub fn signature(image: &DynamicImage) -> Result<PerceptualSignature, HashError> {
        let gray = FastResizer::new().resize_to_grayscale(image, GRID_WIDTH, GRID_HEIGHT)?;
        Ok(Self::signature_from_grid(&gray))
    }

    /// Quantize a 9x8 grid into bits, row-major, most significant bit first
    fn signature_from_grid(gray: &GrayImage) -> PerceptualSignature {
        let mut bits: u64 = 0;
        for y in 0..GRID_HEIGHT {
            for x in 0..GRID_WIDTH - 1 {
                let left = gray.get_pixel(x, y)[0];
                let right = gray.get_pixel(x + 1, y)[0];
                bits <<= 1;
                if left > right {
                    bits |= 1;
                }
            }
        }
        PerceptualSignature::new(bits)
    }
}
