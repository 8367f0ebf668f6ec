//! Primary ONNX encoder: anchor-free face detection plus an embedding
//! network, both running on CPU via ONNX Runtime.
//!
//! The detection model is an SCRFD export decoding at strides 8/16/32; the
//! embedding model produces a 512-dimensional vector, L2-normalized before
//! use so cosine distance is meaningful. Sessions sit behind mutexes — the
//! encoder itself is shared read-only across concurrent recognitions.

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

use crate::encoder::{DetectorSelector, EncoderError, FaceEncoder, MIN_FACE_SIDE};
use crate::imgbuf::{resize_rgb, FaceCrop, PixelBuffer};
use crate::integrity::{DETECTOR_MODEL, EMBEDDER_MODEL};
use crate::types::{BoundingBox, CosineMatcher, Embedding, Matcher};

pub const ONNX_MODEL_TAG: &str = "w600k_r50";

const DETECT_INPUT_SIZE: usize = 640;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

/// Coordinate de-mapping after the letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

pub struct OnnxEncoder {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
    confidence_threshold: f32,
}

impl OnnxEncoder {
    /// Verify and load both model files. Any failure here is recoverable by
    /// the caller via the classical fallback.
    pub fn load(model_dir: &Path, selector: DetectorSelector) -> Result<Self, EncoderError> {
        let detector_path = DETECTOR_MODEL.verify_in(model_dir)?;
        let embedder_path = EMBEDDER_MODEL.verify_in(model_dir)?;

        let detector = Session::builder()
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(&detector_path))
            .map_err(|e| EncoderError::ModelLoadFailure(format!("detection model: {e}")))?;

        if detector.outputs().len() < 6 {
            return Err(EncoderError::ModelLoadFailure(format!(
                "detection model exports {} outputs, need score/bbox tensors for 3 strides",
                detector.outputs().len()
            )));
        }

        let embedder = Session::builder()
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(&embedder_path))
            .map_err(|e| EncoderError::ModelLoadFailure(format!("embedding model: {e}")))?;

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            threshold = selector.confidence_threshold(),
            "ONNX sessions ready"
        );

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            confidence_threshold: selector.confidence_threshold(),
        })
    }

    /// Letterbox the frame into the square detection input, channels-first.
    fn preprocess_detect(&self, image: &PixelBuffer) -> (Array4<f32>, Letterbox) {
        let (w, h) = (image.width as usize, image.height as usize);
        let scale = (DETECT_INPUT_SIZE as f32 / w as f32).min(DETECT_INPUT_SIZE as f32 / h as f32);
        let new_w = ((w as f32 * scale).round() as usize).max(1);
        let new_h = ((h as f32 * scale).round() as usize).max(1);
        let pad_x = (DETECT_INPUT_SIZE - new_w) as f32 / 2.0;
        let pad_y = (DETECT_INPUT_SIZE - new_h) as f32 / 2.0;

        let resized = resize_rgb(&image.rgb, image.width, image.height, new_w as u32, new_h as u32);

        let px0 = pad_x.floor() as usize;
        let py0 = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, DETECT_INPUT_SIZE, DETECT_INPUT_SIZE));
        for y in 0..DETECT_INPUT_SIZE {
            for x in 0..DETECT_INPUT_SIZE {
                let inside = y >= py0 && y < py0 + new_h && x >= px0 && x < px0 + new_w;
                for c in 0..3 {
                    let pixel = if inside {
                        resized[((y - py0) * new_w + (x - px0)) * 3 + c] as f32
                    } else {
                        DETECT_MEAN // pad value normalizes to zero
                    };
                    tensor[[0, c, y, x]] = (pixel - DETECT_MEAN) / DETECT_STD;
                }
            }
        }

        (tensor, Letterbox { scale, pad_x, pad_y })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn model_tag(&self) -> &str {
        ONNX_MODEL_TAG
    }

    fn detect(&self, image: &PixelBuffer) -> Result<Vec<BoundingBox>, EncoderError> {
        let (input, letterbox) = self.preprocess_detect(image);

        let mut detections = Vec::new();
        {
            let mut session = self
                .detector
                .lock()
                .map_err(|_| EncoderError::Inference("detector session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            // Positional output layout: [0..3) scores, [3..6) bbox offsets,
            // one pair per stride.
            for (i, &stride) in STRIDES.iter().enumerate() {
                let (_, scores) = outputs[i].try_extract_tensor::<f32>().map_err(|e| {
                    EncoderError::Inference(format!("scores stride {stride}: {e}"))
                })?;
                let (_, bboxes) = outputs[3 + i].try_extract_tensor::<f32>().map_err(|e| {
                    EncoderError::Inference(format!("bboxes stride {stride}: {e}"))
                })?;
                detections.extend(decode_stride(
                    scores,
                    bboxes,
                    stride,
                    &letterbox,
                    self.confidence_threshold,
                ));
            }
        }

        let mut faces: Vec<BoundingBox> = nms(detections, NMS_IOU_THRESHOLD)
            .into_iter()
            .filter(|b| b.width >= MIN_FACE_SIDE && b.height >= MIN_FACE_SIDE)
            .collect();
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(faces)
    }

    fn encode(&self, crop: &FaceCrop) -> Result<Embedding, EncoderError> {
        let resized = resize_rgb(
            &crop.rgb,
            crop.width,
            crop.height,
            EMBED_INPUT_SIZE as u32,
            EMBED_INPUT_SIZE as u32,
        );

        let mut tensor = Array4::<f32>::zeros((1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE));
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                for c in 0..3 {
                    let pixel = resized[(y * EMBED_INPUT_SIZE + x) * 3 + c] as f32;
                    tensor[[0, c, y, x]] = (pixel - EMBED_MEAN) / EMBED_STD;
                }
            }
        }

        let raw: Vec<f32> = {
            let mut session = self
                .embedder
                .lock()
                .map_err(|_| EncoderError::Inference("embedder session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError::Inference(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != EMBEDDING_DIM {
            return Err(EncoderError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding::new(values, ONNX_MODEL_TAG))
    }

    fn matcher(&self) -> Box<dyn Matcher> {
        Box::new(CosineMatcher)
    }
}

/// Decode score/offset tensors for one stride into frame-space boxes.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = DETECT_INPUT_SIZE / stride;
    let num_anchors = grid * grid * ANCHORS_PER_CELL;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        detections.push(BoundingBox {
            x: (x1 - letterbox.pad_x) / letterbox.scale,
            y: (y1 - letterbox.pad_y) / letterbox.scale,
            width: (x2 - x1) / letterbox.scale,
            height: (y2 - y1) / letterbox.scale,
            confidence: score,
        });
    }
    detections
}

/// Non-maximum suppression: keep the highest-confidence box of each
/// overlapping cluster.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
