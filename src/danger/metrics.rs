//! Image statistics used by the danger checks. All functions take RGB8.

use super::ColorBand;

/// ITU-R BT.601 luma for every pixel.
pub fn luma_plane(pixels: &[u8]) -> Vec<f32> {
    pixels
        .chunks_exact(3)
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LumaStats {
    pub mean: f64,
    pub std_dev: f64,
}

pub fn luma_stats(luma: &[f32]) -> LumaStats {
    if luma.is_empty() {
        return LumaStats {
            mean: 0.0,
            std_dev: 0.0,
        };
    }
    let n = luma.len() as f64;
    let mean = luma.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = luma
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    LumaStats {
        mean,
        std_dev: variance.sqrt(),
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
///
/// High for crisp edges, low for defocused or featureless views.
pub fn laplacian_variance(luma: &[f32], width: u32, height: u32) -> f64 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || luma.len() < w * h {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let response =
                (luma[i - 1] + luma[i + 1] + luma[i - w] + luma[i + w] - 4.0 * luma[i]) as f64;
            sum += response;
            sum_sq += response * response;
            count += 1;
        }
    }
    let n = count as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Hue in degrees (0..360), saturation and value in 0..1.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}

/// Fraction of pixels that fall inside the band.
pub fn band_coverage(pixels: &[u8], band: &ColorBand) -> f64 {
    let mut total = 0usize;
    let mut inside = 0usize;
    for p in pixels.chunks_exact(3) {
        total += 1;
        let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
        if band.contains(h, s, v) {
            inside += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        inside as f64 / total as f64
    }
}
