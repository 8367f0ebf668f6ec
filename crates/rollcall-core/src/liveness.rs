//! Heuristic anti-spoof gate over the cropped face region.
//!
//! Three independent checks run before matching: skin-tone ratio (screens
//! and print artifacts shift the color distribution), local binary pattern
//! texture variance (paper and displays are too uniform at micro scale),
//! and gradient edge density (rejects both overly smooth and overly noisy
//! captures). A face failing any check is excluded from matching.
//!
//! The gate fails closed: a region too small to evaluate is rejected, never
//! passed through.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, flat screen replays, heavily
//!   compressed or synthetic frames.
//! - **Does not block:** high-quality 3D masks or adversarial displays
//!   tuned to a plausible skin distribution.

use serde::Serialize;

use crate::imgbuf::FaceCrop;

/// Gradient magnitude above which a pixel counts as an edge pixel.
const SOBEL_EDGE_THRESHOLD: f32 = 100.0;

/// Thresholds for the three liveness checks.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub enabled: bool,
    /// Minimum fraction of pixels inside the skin-tone HSV range.
    pub min_skin_ratio: f32,
    /// Minimum variance of the 8-neighbor LBP codes.
    pub min_texture_variance: f32,
    /// Edge-pixel fraction must fall inside [min, max].
    pub min_edge_density: f32,
    pub max_edge_density: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_skin_ratio: 0.3,
            min_texture_variance: 100.0,
            min_edge_density: 0.05,
            max_edge_density: 0.30,
        }
    }
}

/// Which check a presentation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessCheck {
    SkinTone,
    Texture,
    EdgeDensity,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessResult {
    pub skin_ratio: f32,
    pub texture_variance: f32,
    pub edge_density: f32,
    /// First failed check, or `None` when the presentation looks live.
    pub failed_check: Option<LivenessCheck>,
}

impl LivenessResult {
    pub fn is_live(&self) -> bool {
        self.failed_check.is_none()
    }

    fn rejected(check: LivenessCheck) -> Self {
        Self {
            skin_ratio: 0.0,
            texture_variance: 0.0,
            edge_density: 0.0,
            failed_check: Some(check),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessDetector {
    config: LivenessConfig,
}

impl LivenessDetector {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Run all three checks over the crop. The first failure wins; the
    /// measured values are always reported for caller diagnostics.
    pub fn check(&self, crop: &FaceCrop) -> LivenessResult {
        if crop.width < 3 || crop.height < 3 {
            // Too small to measure anything — fail closed.
            return LivenessResult::rejected(LivenessCheck::Texture);
        }

        let skin_ratio = skin_ratio(&crop.rgb);
        let texture_variance = lbp_variance(&crop.luma, crop.width, crop.height);
        let edge_density = edge_density(&crop.luma, crop.width, crop.height);

        let failed_check = if skin_ratio < self.config.min_skin_ratio {
            Some(LivenessCheck::SkinTone)
        } else if texture_variance < self.config.min_texture_variance {
            Some(LivenessCheck::Texture)
        } else if edge_density < self.config.min_edge_density
            || edge_density > self.config.max_edge_density
        {
            Some(LivenessCheck::EdgeDensity)
        } else {
            None
        };

        LivenessResult {
            skin_ratio,
            texture_variance,
            edge_density,
            failed_check,
        }
    }
}

/// Fraction of pixels inside the skin-tone range, measured in OpenCV-scaled
/// HSV (H ∈ [0,180], S and V ∈ [0,255]): H ≤ 20, S ≥ 20, V ≥ 70.
fn skin_ratio(rgb: &[u8]) -> f32 {
    let total = rgb.len() / 3;
    if total == 0 {
        return 0.0;
    }
    let skin = rgb
        .chunks_exact(3)
        .filter(|px| {
            let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
            h <= 20.0 && s >= 20.0 && v >= 70.0
        })
        .count();
    skin as f32 / total as f32
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h_deg = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    (h_deg / 2.0, s, v)
}

/// Variance of 8-neighbor local binary pattern codes over the crop interior.
/// A bit is set when the neighbor is at least as bright as the center.
fn lbp_variance(luma: &[u8], width: u32, height: u32) -> f32 {
    let (w, h) = (width as usize, height as usize);
    let mut codes = Vec::with_capacity((w - 2) * (h - 2));

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = luma[y * w + x];
            let neighbors = [
                luma[(y - 1) * w + x - 1],
                luma[(y - 1) * w + x],
                luma[(y - 1) * w + x + 1],
                luma[y * w + x + 1],
                luma[(y + 1) * w + x + 1],
                luma[(y + 1) * w + x],
                luma[(y + 1) * w + x - 1],
                luma[y * w + x - 1],
            ];
            let mut code = 0u8;
            for (k, &n) in neighbors.iter().enumerate() {
                if n >= center {
                    code |= 1 << k;
                }
            }
            codes.push(code as f32);
        }
    }

    let mean = codes.iter().sum::<f32>() / codes.len() as f32;
    codes
        .iter()
        .map(|c| {
            let d = c - mean;
            d * d
        })
        .sum::<f32>()
        / codes.len() as f32
}

/// Fraction of interior pixels whose Sobel gradient magnitude exceeds
/// [`SOBEL_EDGE_THRESHOLD`].
fn edge_density(luma: &[u8], width: u32, height: u32) -> f32 {
    let (w, h) = (width as usize, height as usize);
    let mut edges = 0usize;
    let mut total = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let p = |dy: isize, dx: isize| {
                luma[((y as isize + dy) as usize) * w + (x as isize + dx) as usize] as f32
            };
            let gx = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            let gy = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            if (gx * gx + gy * gy).sqrt() > SOBEL_EDGE_THRESHOLD {
                edges += 1;
            }
            total += 1;
        }
    }

    if total == 0 {
        0.0
    } else {
        edges as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKIN: [u8; 3] = [200, 140, 110];
    const DARK: [u8; 3] = [60, 40, 35];

    fn crop(width: u32, height: u32, rgb: Vec<u8>) -> FaceCrop {
        let luma = rgb
            .chunks_exact(3)
            .map(|px| {
                (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32).round() as u8
            })
            .collect();
        FaceCrop {
            width,
            height,
            rgb,
            luma,
        }
    }

    fn flat(width: u32, height: u32, px: [u8; 3]) -> FaceCrop {
        let rgb = (0..width * height).flat_map(|_| px).collect();
        crop(width, height, rgb)
    }

    /// Skin base with a fine ±8 checker (micro-texture) and a dark 2-px
    /// stripe every 24 rows (macro edges): passes all three checks.
    fn live_like(width: u32, height: u32) -> FaceCrop {
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let striped = y % 24 < 2;
                let base = if striped { DARK } else { SKIN };
                let delta: i16 = if (x + y) % 2 == 0 { 8 } else { -8 };
                for c in base {
                    rgb.push((c as i16 + delta).clamp(0, 255) as u8);
                }
            }
        }
        crop(width, height, rgb)
    }

    /// Deterministic per-pixel noise — far too busy to be a live face.
    fn noisy(width: u32, height: u32) -> FaceCrop {
        let mut state = 0x2545_f491u32;
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let n = (state >> 24) as u16;
            // Keep the hue skin-like so only the edge check trips.
            rgb.push((120 + n / 2) as u8);
            rgb.push((70 + n / 4) as u8);
            rgb.push((50 + n / 8) as u8);
        }
        crop(width, height, rgb)
    }

    #[test]
    fn live_like_crop_passes() {
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&live_like(150, 150));
        assert!(result.is_live(), "failed: {:?}", result);
        assert!(result.skin_ratio > 0.3);
        assert!(result.texture_variance > 100.0);
        assert!(result.edge_density >= 0.05 && result.edge_density <= 0.30);
    }

    #[test]
    fn gray_crop_fails_skin_tone() {
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&flat(100, 100, [128, 128, 128]));
        assert_eq!(result.failed_check, Some(LivenessCheck::SkinTone));
        assert_eq!(result.skin_ratio, 0.0);
    }

    #[test]
    fn flat_skin_crop_fails_texture() {
        // Right color, zero micro-texture — a print or rendered fill.
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&flat(100, 100, SKIN));
        assert_eq!(result.failed_check, Some(LivenessCheck::Texture));
        assert!(result.skin_ratio > 0.99);
    }

    #[test]
    fn textured_but_edgeless_crop_fails_edge_density() {
        // Checker only: micro-texture without any macro structure.
        let mut rgb = Vec::new();
        for y in 0..120u32 {
            for x in 0..120u32 {
                let delta: i16 = if (x + y) % 2 == 0 { 8 } else { -8 };
                for c in SKIN {
                    rgb.push((c as i16 + delta) as u8);
                }
            }
        }
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&crop(120, 120, rgb));
        assert_eq!(result.failed_check, Some(LivenessCheck::EdgeDensity));
        assert!(result.edge_density < 0.05);
    }

    #[test]
    fn noise_storm_fails_edge_density_high() {
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&noisy(120, 120));
        assert_eq!(result.failed_check, Some(LivenessCheck::EdgeDensity));
        assert!(result.edge_density > 0.30, "density {}", result.edge_density);
    }

    #[test]
    fn degenerate_crop_fails_closed() {
        let detector = LivenessDetector::new(LivenessConfig::default());
        let result = detector.check(&flat(2, 2, SKIN));
        assert!(!result.is_live());
    }

    #[test]
    fn thresholds_are_configurable() {
        let permissive = LivenessDetector::new(LivenessConfig {
            enabled: true,
            min_skin_ratio: 0.0,
            min_texture_variance: 0.0,
            min_edge_density: 0.0,
            max_edge_density: 1.0,
        });
        assert!(permissive.check(&flat(50, 50, [128, 128, 128])).is_live());
    }

    #[test]
    fn skin_pixel_classifies_as_skin() {
        let (h, s, v) = rgb_to_hsv(SKIN[0], SKIN[1], SKIN[2]);
        assert!(h <= 20.0, "h = {h}");
        assert!(s >= 20.0, "s = {s}");
        assert!(v >= 70.0, "v = {v}");
    }

    #[test]
    fn dark_pixel_is_not_skin() {
        let (_, _, v) = rgb_to_hsv(DARK[0], DARK[1], DARK[2]);
        assert!(v < 70.0);
    }
}
