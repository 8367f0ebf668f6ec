//! Capture quality assessment for a cropped face region.
//!
//! Four independent sub-scores, each normalized to [0, 1], are combined by a
//! weighted sum. A face below the configured minimum is rejected before any
//! matching work is attempted.

use serde::Serialize;
use thiserror::Error;

use crate::imgbuf::FaceCrop;
use crate::types::BoundingBox;

/// Laplacian variance at which a crop counts as fully sharp.
const SHARPNESS_SCALE: f32 = 1000.0;
/// Reference face area (px²); larger faces score 1.0.
const TARGET_FACE_AREA: f32 = 150.0 * 150.0;
/// Luma standard deviation is scaled by this factor before capping.
const CONTRAST_SCALE: f32 = 4.0;

#[derive(Error, Debug)]
pub enum QualityConfigError {
    #[error("quality weights must sum to 1.0 (got {0})")]
    WeightsDoNotSumToOne(f32),
}

/// Relative weight of each sub-score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityWeights {
    pub sharpness: f32,
    pub brightness: f32,
    pub size: f32,
    pub contrast: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 0.30,
            brightness: 0.25,
            size: 0.25,
            contrast: 0.20,
        }
    }
}

impl QualityWeights {
    pub fn validate(&self) -> Result<(), QualityConfigError> {
        let sum = self.sharpness + self.brightness + self.size + self.contrast;
        if (sum - 1.0).abs() > 1e-3 {
            return Err(QualityConfigError::WeightsDoNotSumToOne(sum));
        }
        Ok(())
    }
}

/// Per-dimension quality breakdown, returned to callers so a live camera
/// loop can retry with a better frame.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityScores {
    pub sharpness: f32,
    pub brightness: f32,
    pub size: f32,
    pub contrast: f32,
    pub overall: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityAssessor {
    weights: QualityWeights,
}

impl QualityAssessor {
    pub fn new(weights: QualityWeights) -> Result<Self, QualityConfigError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    /// Score a cropped face. `face` is the original detection box; its area
    /// (not the padded crop's) drives the size score.
    pub fn assess(&self, crop: &FaceCrop, face: &BoundingBox) -> QualityScores {
        let sharpness = (laplacian_variance(&crop.luma, crop.width, crop.height)
            / SHARPNESS_SCALE)
            .min(1.0);

        let mean = mean_luma(&crop.luma) / 255.0;
        let brightness = (1.0 - (mean - 0.5).abs() * 2.0).max(0.0);

        let size = (face.area() / TARGET_FACE_AREA).min(1.0);

        let contrast = (luma_std(&crop.luma) / 255.0 * CONTRAST_SCALE).min(1.0);

        let overall = sharpness * self.weights.sharpness
            + brightness * self.weights.brightness
            + size * self.weights.size
            + contrast * self.weights.contrast;

        QualityScores {
            sharpness,
            brightness,
            size,
            contrast,
            overall,
        }
    }
}

fn mean_luma(luma: &[u8]) -> f32 {
    if luma.is_empty() {
        return 0.0;
    }
    luma.iter().map(|&p| p as f32).sum::<f32>() / luma.len() as f32
}

fn luma_std(luma: &[u8]) -> f32 {
    if luma.is_empty() {
        return 0.0;
    }
    let mean = mean_luma(luma);
    let var = luma
        .iter()
        .map(|&p| {
            let d = p as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / luma.len() as f32;
    var.sqrt()
}

/// Variance of the 4-neighbor Laplacian response over the crop interior.
fn laplacian_variance(luma: &[u8], width: u32, height: u32) -> f32 {
    let (w, h) = (width as usize, height as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = luma[y * w + x] as f32;
            let up = luma[(y - 1) * w + x] as f32;
            let down = luma[(y + 1) * w + x] as f32;
            let left = luma[y * w + x - 1] as f32;
            let right = luma[y * w + x + 1] as f32;
            responses.push(up + down + left + right - 4.0 * c);
        }
    }

    let mean = responses.iter().sum::<f32>() / responses.len() as f32;
    responses
        .iter()
        .map(|r| {
            let d = r - mean;
            d * d
        })
        .sum::<f32>()
        / responses.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop_from_luma(luma: Vec<u8>, width: u32, height: u32) -> FaceCrop {
        let rgb = luma.iter().flat_map(|&p| [p, p, p]).collect();
        FaceCrop {
            width,
            height,
            rgb,
            luma,
        }
    }

    fn face(width: f32, height: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width,
            height,
            confidence: 0.9,
        }
    }

    /// Fine checker pattern around a mid-gray base: sharp, mid-bright.
    fn checkered_luma(w: usize, h: usize, amplitude: i16) -> Vec<u8> {
        let mut luma = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let sign: i16 = if (x + y) % 2 == 0 { 1 } else { -1 };
                luma[y * w + x] = (128 + sign * amplitude).clamp(0, 255) as u8;
            }
        }
        luma
    }

    /// 3×3 box blur, the cheapest way to make a strictly softer image.
    fn box_blur(luma: &[u8], w: usize, h: usize) -> Vec<u8> {
        let mut out = luma.to_vec();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut sum = 0u32;
                for dy in 0..3 {
                    for dx in 0..3 {
                        sum += luma[(y + dy - 1) * w + (x + dx - 1)] as u32;
                    }
                }
                out[y * w + x] = (sum / 9) as u8;
            }
        }
        out
    }

    #[test]
    fn default_weights_are_valid() {
        QualityWeights::default().validate().unwrap();
    }

    #[test]
    fn bad_weights_are_rejected() {
        let weights = QualityWeights {
            sharpness: 0.5,
            brightness: 0.5,
            size: 0.5,
            contrast: 0.5,
        };
        assert!(matches!(
            weights.validate(),
            Err(QualityConfigError::WeightsDoNotSumToOne(_))
        ));
        assert!(QualityAssessor::new(weights).is_err());
    }

    #[test]
    fn scores_are_bounded() {
        let assessor = QualityAssessor::new(QualityWeights::default()).unwrap();
        let crop = crop_from_luma(checkered_luma(160, 160, 60), 160, 160);
        let scores = assessor.assess(&crop, &face(160.0, 160.0));
        for s in [
            scores.sharpness,
            scores.brightness,
            scores.size,
            scores.contrast,
            scores.overall,
        ] {
            assert!((0.0..=1.0).contains(&s), "score {s} out of bounds");
        }
    }

    #[test]
    fn blur_never_increases_sharpness() {
        let assessor = QualityAssessor::new(QualityWeights::default()).unwrap();
        let w = 120;
        let h = 120;
        let sharp = checkered_luma(w, h, 25);
        let soft = box_blur(&sharp, w, h);

        let sharp_scores = assessor.assess(
            &crop_from_luma(sharp, w as u32, h as u32),
            &face(w as f32, h as f32),
        );
        let soft_scores = assessor.assess(
            &crop_from_luma(soft, w as u32, h as u32),
            &face(w as f32, h as f32),
        );

        assert!(
            sharp_scores.sharpness >= soft_scores.sharpness,
            "sharp {} < blurred {}",
            sharp_scores.sharpness,
            soft_scores.sharpness
        );
        assert!(sharp_scores.overall >= soft_scores.overall);
    }

    #[test]
    fn mid_gray_peaks_brightness() {
        let assessor = QualityAssessor::new(QualityWeights::default()).unwrap();
        let mid = assessor.assess(
            &crop_from_luma(vec![128; 100 * 100], 100, 100),
            &face(100.0, 100.0),
        );
        let dark = assessor.assess(
            &crop_from_luma(vec![10; 100 * 100], 100, 100),
            &face(100.0, 100.0),
        );
        let bright = assessor.assess(
            &crop_from_luma(vec![250; 100 * 100], 100, 100),
            &face(100.0, 100.0),
        );
        assert!(mid.brightness > dark.brightness);
        assert!(mid.brightness > bright.brightness);
        assert!(mid.brightness > 0.99);
    }

    #[test]
    fn large_faces_cap_size_score() {
        let assessor = QualityAssessor::new(QualityWeights::default()).unwrap();
        let crop = crop_from_luma(vec![128; 50 * 50], 50, 50);
        let small = assessor.assess(&crop, &face(75.0, 75.0));
        let large = assessor.assess(&crop, &face(300.0, 300.0));
        assert!((small.size - 0.25).abs() < 1e-3);
        assert!((large.size - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flat_crop_has_no_sharpness_or_contrast() {
        let assessor = QualityAssessor::new(QualityWeights::default()).unwrap();
        let scores = assessor.assess(
            &crop_from_luma(vec![128; 80 * 80], 80, 80),
            &face(80.0, 80.0),
        );
        assert_eq!(scores.sharpness, 0.0);
        assert_eq!(scores.contrast, 0.0);
    }
}
