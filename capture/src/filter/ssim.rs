use image::{GrayImage, Luma, RgbImage};
use tracing::trace;

use super::traits::SimilarityScorer;

pub const DEFAULT_WINDOW: u32 = 7;
const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

/// Structural similarity over uniform square windows.
///
/// Algorithm:
/// 1. Slide a `window x window` box over every position where it fits
///    entirely inside both images
/// 2. Per box, compare means, sample variances and covariance:
///    `((2 ux uy + C1)(2 sxy + C2)) / ((ux^2 + uy^2 + C1)(sx^2 + sy^2 + C2))`
/// 3. Average over all boxes
///
/// Box sums are maintained incrementally (running column sums updated one
/// row at a time), so memory stays proportional to the image width.
#[derive(Debug, Clone, Copy)]
pub struct Ssim {
    window: u32,
}

impl Default for Ssim {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
        }
    }
}

impl SimilarityScorer for Ssim {
    fn score(&mut self, prior: &GrayImage, candidate: &GrayImage) -> Result<f64, ScoreError> {
        ssim(prior, candidate, self.window)
    }

    fn name(&self) -> &str {
        "ssim"
    }
}

/// Luma with the `0.299 R + 0.587 G + 0.114 B` weights, rounded.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut out = GrayImage::new(width, height);
    for (dst, src) in out.pixels_mut().zip(image.pixels()) {
        let [r, g, b] = src.0.map(u32::from);
        let y = (r * 299 + g * 587 + b * 114 + 500) / 1000;
        *dst = Luma([y as u8]);
    }
    out
}

pub fn ssim(prior: &GrayImage, candidate: &GrayImage, window: u32) -> Result<f64, ScoreError> {
    if prior.dimensions() != candidate.dimensions() {
        return Err(ScoreError::DimensionMismatch {
            prior: prior.dimensions(),
            candidate: candidate.dimensions(),
        });
    }
    let (width, height) = prior.dimensions();
    if width < window || height < window {
        return Err(ScoreError::TooSmall {
            width,
            height,
            window,
        });
    }

    let (w, h, win) = (width as usize, height as usize, window as usize);
    let a = prior.as_raw();
    let b = candidate.as_raw();

    let n = (win * win) as f64;
    let cov_norm = n / (n - 1.0);
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    // Per column: sums of x, y, x^2, y^2, xy over the current band of rows.
    let mut cols = vec![[0i64; 5]; w];
    let update_row = |cols: &mut [[i64; 5]], y: usize, sign: i64| {
        let row = y * w;
        for (x, col) in cols.iter_mut().enumerate() {
            let p = i64::from(a[row + x]);
            let q = i64::from(b[row + x]);
            col[0] += sign * p;
            col[1] += sign * q;
            col[2] += sign * p * p;
            col[3] += sign * q * q;
            col[4] += sign * p * q;
        }
    };

    for y in 0..win {
        update_row(&mut cols, y, 1);
    }

    let mut total = 0.0;
    let mut count = 0u64;
    for top in 0..=h - win {
        if top > 0 {
            update_row(&mut cols, top - 1, -1);
            update_row(&mut cols, top + win - 1, 1);
        }

        let mut acc = [0i64; 5];
        for col in &cols[..win] {
            add(&mut acc, col, 1);
        }
        for left in 0..=w - win {
            if left > 0 {
                add(&mut acc, &cols[left - 1], -1);
                add(&mut acc, &cols[left + win - 1], 1);
            }

            let [sx, sy, sxx, syy, sxy] = acc.map(|v| v as f64);
            let ux = sx / n;
            let uy = sy / n;
            let vx = cov_norm * (sxx / n - ux * ux);
            let vy = cov_norm * (syy / n - uy * uy);
            let vxy = cov_norm * (sxy / n - ux * uy);

            total += ((2.0 * ux * uy + c1) * (2.0 * vxy + c2))
                / ((ux * ux + uy * uy + c1) * (vx + vy + c2));
            count += 1;
        }
    }

    let score = total / count as f64;
    trace!(width, height, window, windows = count, score, "ssim computed");
    Ok(score)
}

fn add(acc: &mut [i64; 5], col: &[i64; 5], sign: i64) {
    for (a, c) in acc.iter_mut().zip(col) {
        *a += sign * c;
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("frame sizes differ: {prior:?} vs {candidate:?}")]
    DimensionMismatch {
        prior: (u32, u32),
        candidate: (u32, u32),
    },
    #[error("{width}x{height} frame is smaller than the {window}x{window} window")]
    TooSmall { width: u32, height: u32, window: u32 },
}
