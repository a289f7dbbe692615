//! Windowed structural similarity (SSIM).
//!
//! For every window the luminance, contrast and structure terms are folded
//! into the usual closed form
//!
//! ```text
//! (2·μx·μy + C1)(2·σxy + C2) / ((μx² + μy² + C1)(σx² + σy² + C2))
//! ```
//!
//! and the window scores are averaged. Negative correlations are clamped so
//! the result always lands in `[0, 1]`.

use super::StructuralMetric;
use image::GrayImage;

const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Mean SSIM over square windows
#[derive(Debug, Clone)]
pub struct WindowedSsim {
    window: u32,
    stride: u32,
}

impl WindowedSsim {
    pub fn new(window: u32, stride: u32) -> Self {
        Self {
            window: window.max(1),
            stride: stride.max(1),
        }
    }

    fn window_score(&self, a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f64 {
        let n = (w * h) as f64;
        let (mut sum_a, mut sum_b) = (0.0, 0.0);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                sum_a += a.get_pixel(x, y)[0] as f64;
                sum_b += b.get_pixel(x, y)[0] as f64;
            }
        }
        let (mean_a, mean_b) = (sum_a / n, sum_b / n);

        let (mut var_a, mut var_b, mut cov) = (0.0, 0.0, 0.0);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let da = a.get_pixel(x, y)[0] as f64 - mean_a;
                let db = b.get_pixel(x, y)[0] as f64 - mean_b;
                var_a += da * da;
                var_b += db * db;
                cov += da * db;
            }
        }
        var_a /= n;
        var_b /= n;
        cov /= n;

        let numerator = (2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2);
        let denominator = (mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2);
        numerator / denominator
    }

    fn window_origins(&self, extent: u32) -> Vec<u32> {
        if extent <= self.window {
            return vec![0];
        }
        let mut origins: Vec<u32> = (0..=extent - self.window).step_by(self.stride as usize).collect();
        // Cover the trailing edge when the stride doesn't land on it
        let last = extent - self.window;
        if origins.last() != Some(&last) {
            origins.push(last);
        }
        origins
    }
}

impl Default for WindowedSsim {
    fn default() -> Self {
        Self::new(8, 4)
    }
}

impl StructuralMetric for WindowedSsim {
    /// Images of different dimensions score 0.
    fn score(&self, a: &GrayImage, b: &GrayImage) -> f64 {
        if a.dimensions() != b.dimensions() || a.width() == 0 || a.height() == 0 {
            return 0.0;
        }
        let (width, height) = a.dimensions();
        let w = self.window.min(width);
        let h = self.window.min(height);

        let xs = self.window_origins(width);
        let ys = self.window_origins(height);

        let mut total = 0.0;
        let mut count = 0usize;
        for &y in &ys {
            for &x in &xs {
                total += self.window_score(a, b, x, y, w, h);
                count += 1;
            }
        }

        (total / count as f64).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "ssim"
    }
}
