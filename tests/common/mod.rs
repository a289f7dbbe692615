//! Synthetic receipt images for integration tests.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use std::io::Cursor;

/// Grayscale "receipt" made of random 16x16 blocks; same seed, same pixels.
///
/// `brighten` lifts every pixel uniformly, which changes the bytes but
/// keeps the image perceptually identical.
pub fn receipt_png(seed: u64, brighten: u8) -> Vec<u8> {
    encode(receipt_pixels(seed, brighten), image::ImageFormat::Png)
}

/// Same pixels as [`receipt_png`], JPEG encoded
#[allow(dead_code)]
pub fn receipt_jpeg(seed: u64) -> Vec<u8> {
    encode(receipt_pixels(seed, 0), image::ImageFormat::Jpeg)
}

fn receipt_pixels(seed: u64, brighten: u8) -> GrayImage {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut levels = [0u8; 256];
    for level in levels.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *level = 30 + (state % 170) as u8;
    }
    ImageBuffer::from_fn(256, 256, |x, y| {
        Luma([levels[((y / 16) * 16 + x / 16) as usize].saturating_add(brighten)])
    })
}

fn encode(pixels: GrayImage, format: image::ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(pixels)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}
