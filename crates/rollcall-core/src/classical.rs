//! Classical fallback encoder.
//!
//! No model files: detection is a centered variance window (a face in frame
//! produces strong local structure; an empty or flat frame does not), and
//! the embedding is a 256-bin normalized luma histogram over the resized
//! crop, compared with chi-square distance. Deliberately lower accuracy than
//! the ONNX pipeline — it keeps the pipeline contract alive when the model
//! files are absent or corrupt.

use crate::imgbuf::{resize_luma, FaceCrop, PixelBuffer};
use crate::types::{BoundingBox, ChiSquareMatcher, Embedding, Matcher};
use crate::encoder::{EncoderError, FaceEncoder, MIN_FACE_SIDE};

pub const CLASSICAL_MODEL_TAG: &str = "luma-hist-256";

/// Luma variance inside the detection window below which no face is
/// reported.
const DETECTION_VARIANCE_FLOOR: f32 = 150.0;
/// Fraction of the short image side used for the detection window.
const WINDOW_FRACTION: f32 = 0.6;
/// Fixed detection confidence, in the spirit of cascade detectors that
/// report no calibrated score.
const DETECTION_CONFIDENCE: f32 = 0.8;
/// Histogram features are computed over a crop resized to this side.
const FEATURE_SIDE: u32 = 100;

pub struct ClassicalEncoder;

impl ClassicalEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClassicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceEncoder for ClassicalEncoder {
    fn model_tag(&self) -> &str {
        CLASSICAL_MODEL_TAG
    }

    fn detect(&self, image: &PixelBuffer) -> Result<Vec<BoundingBox>, EncoderError> {
        let short_side = image.width.min(image.height) as f32;
        let side = (short_side * WINDOW_FRACTION).max(MIN_FACE_SIDE);
        if side > short_side {
            // Frame too small to hold a usable face.
            return Ok(Vec::new());
        }

        let side_px = side as u32;
        let x0 = (image.width - side_px) / 2;
        let y0 = (image.height - side_px) / 2;

        let variance = window_variance(&image.luma, image.width, x0, y0, side_px);
        if variance < DETECTION_VARIANCE_FLOOR {
            return Ok(Vec::new());
        }

        Ok(vec![BoundingBox {
            x: x0 as f32,
            y: y0 as f32,
            width: side,
            height: side,
            confidence: DETECTION_CONFIDENCE,
        }])
    }

    fn encode(&self, crop: &FaceCrop) -> Result<Embedding, EncoderError> {
        let resized = resize_luma(&crop.luma, crop.width, crop.height, FEATURE_SIDE, FEATURE_SIDE);

        let mut counts = [0u32; 256];
        for &p in &resized {
            counts[p as usize] += 1;
        }

        let total = resized.len() as f32;
        let values = counts.iter().map(|&c| c as f32 / total).collect();
        Ok(Embedding::new(values, CLASSICAL_MODEL_TAG))
    }

    fn matcher(&self) -> Box<dyn Matcher> {
        Box::new(ChiSquareMatcher)
    }
}

fn window_variance(luma: &[u8], image_width: u32, x0: u32, y0: u32, side: u32) -> f32 {
    let w = image_width as usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let n = (side * side) as f64;

    for y in y0..y0 + side {
        for x in x0..x0 + side {
            let p = luma[y as usize * w + x as usize] as f64;
            sum += p;
            sum_sq += p * p;
        }
    }

    let mean = sum / n;
    ((sum_sq / n) - mean * mean) as f32
}
