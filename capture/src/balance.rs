//! Gray-world white balance.
//!
//! Works in CIE L*a*b* scaled to the usual 8-bit layout: `L` spans 0..=255
//! and the two chroma channels are offset so that 128 is neutral. For each
//! chroma channel the mean deviation from neutral is removed, weighted per
//! pixel by that pixel's own lightness:
//!
//! ```text
//! c' = c - (mean(c) - 128) * (L / 255) * gain
//! ```
//!
//! so bright pixels receive proportionally more correction than dark ones.

use camdrop_common::config::BalanceConfig;
use image::{Rgb, RgbImage};
use tracing::debug;

pub const DEFAULT_GAIN: f64 = 1.1;
const NEUTRAL_CHROMA: f64 = 128.0;
const MAX_LUMINANCE: f64 = 255.0;

// sRGB (D65) <-> XYZ
const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.412453, 0.357580, 0.180423],
    [0.212671, 0.715160, 0.072169],
    [0.019334, 0.119193, 0.950227],
];
const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.240479, -1.53715, -0.498535],
    [-0.969256, 1.875991, 0.041556],
    [0.055648, -0.204043, 1.057311],
];
const WHITE_X: f64 = 0.950456;
const WHITE_Z: f64 = 1.088754;

const LAB_EPSILON: f64 = 0.008856;
const LAB_KAPPA: f64 = 903.3;
const LAB_SLOPE: f64 = 7.787;
const LAB_OFFSET: f64 = 16.0 / 116.0;

#[derive(Debug, Clone, Copy)]
pub struct ColorBalancer {
    gain: f64,
}

impl Default for ColorBalancer {
    fn default() -> Self {
        Self { gain: DEFAULT_GAIN }
    }
}

impl ColorBalancer {
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }

    /// `None` when balancing is switched off in the config.
    pub fn from_config(config: &BalanceConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config.gain))
    }

    /// Return a white-balanced copy of `image` with the same dimensions.
    pub fn correct(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return image.clone();
        }

        let lut = linear_lut();
        let lab: Vec<[f64; 3]> = image.pixels().map(|p| rgb_to_lab(p.0, &lut)).collect();
        let [mean_a, mean_b] = means(&lab);

        let mut out = RgbImage::new(width, height);
        for (dst, px) in out.pixels_mut().zip(&lab) {
            let a = corrected_chroma(px[1], mean_a, px[0], self.gain);
            let b = corrected_chroma(px[2], mean_b, px[0], self.gain);
            *dst = Rgb(lab_to_rgb([px[0], a, b]));
        }

        debug!(
            width,
            height,
            mean_a = format!("{:.2}", mean_a),
            mean_b = format!("{:.2}", mean_b),
            gain = self.gain,
            "applied gray-world balance"
        );
        out
    }
}

fn means(lab: &[[f64; 3]]) -> [f64; 2] {
    if lab.is_empty() {
        return [NEUTRAL_CHROMA, NEUTRAL_CHROMA];
    }
    let n = lab.len() as f64;
    let (sum_a, sum_b) = lab
        .iter()
        .fold((0.0, 0.0), |(a, b), px| (a + px[1], b + px[2]));
    [sum_a / n, sum_b / n]
}

fn corrected_chroma(value: f64, mean: f64, luminance: f64, gain: f64) -> f64 {
    let shift = (mean - NEUTRAL_CHROMA) * (luminance / MAX_LUMINANCE) * gain;
    (value - shift).clamp(0.0, 255.0)
}

fn linear_lut() -> [f64; 256] {
    std::array::from_fn(|i| srgb_to_linear(i as f64 / 255.0))
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.0031308 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        LAB_SLOPE * t + LAB_OFFSET
    }
}

fn lab_f_inv(f: f64) -> f64 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        (f - LAB_OFFSET) / LAB_SLOPE
    }
}

fn mul(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// 8-bit RGB to `[L, a, b]` with `L` in 0..=255 and chroma centred on 128.
fn rgb_to_lab(rgb: [u8; 3], lut: &[f64; 256]) -> [f64; 3] {
    let linear = [lut[rgb[0] as usize], lut[rgb[1] as usize], lut[rgb[2] as usize]];
    let [x, y, z] = mul(&RGB_TO_XYZ, linear);
    let (fx, fy, fz) = (lab_f(x / WHITE_X), lab_f(y), lab_f(z / WHITE_Z));

    let l = if y > LAB_EPSILON {
        116.0 * fy - 16.0
    } else {
        LAB_KAPPA * y
    };
    [
        l * MAX_LUMINANCE / 100.0,
        500.0 * (fx - fy) + NEUTRAL_CHROMA,
        200.0 * (fy - fz) + NEUTRAL_CHROMA,
    ]
}

fn lab_to_rgb(lab: [f64; 3]) -> [u8; 3] {
    let l = lab[0] * 100.0 / MAX_LUMINANCE;
    let a = lab[1] - NEUTRAL_CHROMA;
    let b = lab[2] - NEUTRAL_CHROMA;

    let fy = (l + 16.0) / 116.0;
    let y = if l > LAB_KAPPA * LAB_EPSILON {
        fy * fy * fy
    } else {
        l / LAB_KAPPA
    };
    let x = lab_f_inv(fy + a / 500.0) * WHITE_X;
    let z = lab_f_inv(fy - b / 200.0) * WHITE_Z;

    mul(&XYZ_TO_RGB, [x, y, z]).map(|c| {
        let encoded = linear_to_srgb(c.clamp(0.0, 1.0));
        (encoded * 255.0).round().clamp(0.0, 255.0) as u8
    })
}
