//! The face encoding contract and encoder selection.
//!
//! Two implementations share one interface: the ONNX pipeline (detection
//! network + embedding network) and the classical fallback (variance-window
//! detection + luma histogram features). The daemon selects one at startup;
//! everything downstream — matching included — works purely against the
//! trait, so the fallback is transparent to the rest of the pipeline.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::classical::ClassicalEncoder;
use crate::imgbuf::{FaceCrop, PixelBuffer};
use crate::integrity::ModelIntegrityError;
use crate::onnx::OnnxEncoder;
use crate::types::{BoundingBox, Embedding, Matcher};

/// Minimum face side length in source-image pixels; smaller detections are
/// discarded before primary selection.
pub const MIN_FACE_SIDE: f32 = 50.0;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model load failure: {0}")]
    ModelLoadFailure(String),
    #[error("model integrity: {0}")]
    Integrity(#[from] ModelIntegrityError),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection model selection: the accuracy/speed trade-off, plus an
/// explicit opt-in to the classical fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSelector {
    /// High detection-confidence threshold; fewer, surer faces.
    Accurate,
    /// Lower threshold; faster to a usable detection on weak frames.
    Fast,
    /// Skip the ONNX pipeline entirely.
    Classical,
}

impl DetectorSelector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accurate" => Some(Self::Accurate),
            "fast" => Some(Self::Fast),
            "classical" => Some(Self::Classical),
            _ => None,
        }
    }

    /// Minimum detection confidence for this selector.
    pub fn confidence_threshold(self) -> f32 {
        match self {
            Self::Accurate => 0.7,
            Self::Fast | Self::Classical => 0.5,
        }
    }
}

/// One face-encoding implementation: detection, embedding extraction and
/// the paired comparison strategy.
pub trait FaceEncoder: Send + Sync {
    /// Tag identifying the embedding space (stored alongside templates).
    fn model_tag(&self) -> &str;

    /// Detect faces, already filtered by the minimum confidence and the
    /// minimum size, sorted by descending detection confidence.
    fn detect(&self, image: &PixelBuffer) -> Result<Vec<BoundingBox>, EncoderError>;

    /// Extract an embedding from a cropped face region. Deterministic for
    /// identical crop bytes.
    fn encode(&self, crop: &FaceCrop) -> Result<Embedding, EncoderError>;

    /// The matcher that understands this encoder's embedding space.
    fn matcher(&self) -> Box<dyn Matcher>;
}

/// Pick the primary detection: largest box area, ties broken by higher
/// detection confidence. Returns the primary and the discarded count.
pub fn primary_face(faces: &[BoundingBox]) -> Option<(&BoundingBox, usize)> {
    let primary = faces.iter().max_by(|a, b| {
        a.area()
            .partial_cmp(&b.area())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    })?;
    Some((primary, faces.len() - 1))
}

/// The encoder chosen at startup.
pub struct LoadedEncoder {
    pub encoder: Arc<dyn FaceEncoder>,
    /// True when the primary pipeline failed to initialize and the
    /// classical encoder took its place.
    pub fallback_engaged: bool,
}

/// Initialize the configured encoder, falling back to the classical one if
/// the ONNX pipeline cannot start. The process only refuses to come up when
/// no encoder at all can be constructed, which the classical implementation
/// rules out.
pub fn load_encoder(model_dir: &Path, selector: DetectorSelector) -> LoadedEncoder {
    if selector == DetectorSelector::Classical {
        tracing::info!("classical encoder selected by configuration");
        return LoadedEncoder {
            encoder: Arc::new(ClassicalEncoder::new()),
            fallback_engaged: false,
        };
    }

    match OnnxEncoder::load(model_dir, selector) {
        Ok(encoder) => {
            tracing::info!(model_dir = %model_dir.display(), "ONNX encoder loaded");
            LoadedEncoder {
                encoder: Arc::new(encoder),
                fallback_engaged: false,
            }
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "primary encoder failed to initialize; falling back to classical encoder"
            );
            LoadedEncoder {
                encoder: Arc::new(ClassicalEncoder::new()),
                fallback_engaged: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: w,
            height: h,
            confidence,
        }
    }

    #[test]
    fn primary_face_prefers_largest_area() {
        let faces = vec![bbox(60.0, 60.0, 0.99), bbox(100.0, 100.0, 0.7)];
        let (primary, discarded) = primary_face(&faces).unwrap();
        assert!((primary.width - 100.0).abs() < 1e-6);
        assert_eq!(discarded, 1);
    }

    #[test]
    fn primary_face_breaks_area_ties_by_confidence() {
        let faces = vec![bbox(80.0, 80.0, 0.6), bbox(80.0, 80.0, 0.9)];
        let (primary, _) = primary_face(&faces).unwrap();
        assert!((primary.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn primary_face_empty_is_none() {
        assert!(primary_face(&[]).is_none());
    }

    #[test]
    fn selector_parses_known_values() {
        assert_eq!(
            DetectorSelector::parse("accurate"),
            Some(DetectorSelector::Accurate)
        );
        assert_eq!(DetectorSelector::parse("fast"), Some(DetectorSelector::Fast));
        assert_eq!(
            DetectorSelector::parse("classical"),
            Some(DetectorSelector::Classical)
        );
        assert_eq!(DetectorSelector::parse("cnn"), None);
    }

    #[test]
    fn missing_models_engage_fallback() {
        let dir = std::env::temp_dir().join("rollcall-no-models-here");
        let loaded = load_encoder(&dir, DetectorSelector::Accurate);
        assert!(loaded.fallback_engaged);
        assert_eq!(loaded.encoder.model_tag(), crate::classical::CLASSICAL_MODEL_TAG);
    }

    #[test]
    fn classical_selection_is_not_a_fallback() {
        let dir = std::env::temp_dir().join("rollcall-no-models-here");
        let loaded = load_encoder(&dir, DetectorSelector::Classical);
        assert!(!loaded.fallback_engaged);
    }
}
