//! SIMD-accelerated grayscale resizing.
//!
//! Both the perceptual signature grid and the structural-similarity
//! normalization go through here. fast_image_resize picks AVX2/NEON
//! kernels when the CPU has them.

use crate::error::HashError;
use fast_image_resize::{images::Image, FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};

/// Reusable resizer; keeps its scratch buffers between calls
pub struct FastResizer {
    resizer: Resizer,
}

impl FastResizer {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
        }
    }

    /// Convert to luminance, then resize to `width` x `height`.
    ///
    /// Grayscale conversion happens first so the resize runs on one
    /// channel instead of three.
    pub fn resize_to_grayscale(
        &mut self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<GrayImage, HashError> {
        let gray = image.to_luma8();
        self.resize_gray(gray, width, height)
    }

    /// Resize an already-grayscale buffer
    pub fn resize_gray(
        &mut self,
        gray: GrayImage,
        width: u32,
        height: u32,
    ) -> Result<GrayImage, HashError> {
        let (src_width, src_height) = gray.dimensions();
        if src_width == 0 || src_height == 0 {
            return Err(HashError::EmptyImage);
        }
        if width == 0 || height == 0 {
            return Err(HashError::Resize(format!(
                "invalid target dimensions {}x{}",
                width, height
            )));
        }
        if (src_width, src_height) == (width, height) {
            return Ok(gray);
        }

        let src_image = Image::from_vec_u8(src_width, src_height, gray.into_raw(), PixelType::U8)
            .map_err(|e| HashError::Resize(format!("source buffer rejected: {}", e)))?;
        let mut dst_image = Image::new(width, height, PixelType::U8);

        // Bilinear is enough at hashing scale and keeps results stable across CPUs
        let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));

        self.resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| HashError::Resize(e.to_string()))?;

        let result: ImageBuffer<Luma<u8>, Vec<u8>> =
            ImageBuffer::from_raw(width, height, dst_image.into_vec())
                .ok_or_else(|| HashError::Resize("destination buffer size mismatch".to_string()))?;

        Ok(result)
    }
}

impl Default for FastResizer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-off resize for callers that don't keep a resizer around
pub fn resize_to_grayscale(
    image: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<GrayImage, HashError> {
    FastResizer::new().resize_to_grayscale(image, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            Rgb([r, g, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn resize_produces_signature_grid() {
        let resized = resize_to_grayscale(&create_test_image(200, 100), 9, 8).unwrap();
        assert_eq!(resized.dimensions(), (9, 8));
    }

    #[test]
    fn upscales_small_sources() {
        let resized = resize_to_grayscale(&create_test_image(4, 4), 16, 16).unwrap();
        assert_eq!(resized.dimensions(), (16, 16));
    }

    #[test]
    fn same_size_is_passthrough() {
        let image = create_test_image(12, 12);
        let expected = image.to_luma8();
        let resized = resize_to_grayscale(&image, 12, 12).unwrap();
        assert_eq!(resized, expected);
    }

    #[test]
    fn zero_target_is_rejected() {
        let result = resize_to_grayscale(&create_test_image(10, 10), 0, 8);
        assert!(matches!(result, Err(HashError::Resize(_))));
    }

    #[test]
    fn resizer_is_reusable() {
        let mut resizer = FastResizer::new();
        let image = create_test_image(64, 48);
        let first = resizer.resize_to_grayscale(&image, 9, 8).unwrap();
        let second = resizer.resize_to_grayscale(&image, 9, 8).unwrap();
        assert_eq!(first, second);
    }
}
