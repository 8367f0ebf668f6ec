//! rollcall-core — Attendance recognition engine.
//!
//! Detects and encodes faces from submitted classroom frames, gates the
//! candidates on capture quality and liveness, and matches them against a
//! per-course gallery of enrolled embeddings. The primary encoder runs ONNX
//! detection and embedding models; a classical histogram encoder serves as
//! the startup fallback when the model files are unavailable.

pub mod classical;
pub mod codec;
pub mod encoder;
pub mod gallery;
pub mod imgbuf;
pub mod integrity;
pub mod liveness;
pub mod onnx;
pub mod quality;
pub mod types;

pub use encoder::{load_encoder, DetectorSelector, EncoderError, FaceEncoder, LoadedEncoder};
pub use gallery::{Gallery, GalleryCache, GalleryEntry};
pub use imgbuf::{FaceCrop, ImageError, PixelBuffer};
pub use liveness::{LivenessDetector, LivenessResult};
pub use quality::{QualityAssessor, QualityScores, QualityWeights};
pub use types::{
    BoundingBox, ChiSquareMatcher, CosineMatcher, Embedding, MatchResult, MatchThresholds, Matcher,
};
