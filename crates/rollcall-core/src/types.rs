use serde::{Deserialize, Serialize};

use crate::gallery::GalleryEntry;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Face embedding: a fixed-length vector comparable by a distance metric.
///
/// `model_tag` names the encoder that produced the vector. Embeddings from
/// different encoders are never comparable and must not share a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_tag: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_tag: impl Into<String>) -> Self {
        Self {
            values,
            model_tag: model_tag.into(),
        }
    }

    /// Cosine distance in [0, 2]: `1 − cos(a, b)`. Zero means identical
    /// direction. Always walks every dimension.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            1.0 - dot / denom
        } else {
            1.0
        }
    }

    /// Chi-square distance between two normalized histograms, halved so the
    /// result lies in [0, 1] when both inputs sum to 1.
    pub fn chi_square_distance(&self, other: &Embedding) -> f32 {
        let mut sum = 0.0f32;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let denom = a + b;
            if denom > 0.0 {
                let diff = a - b;
                sum += diff * diff / denom;
            }
        }
        0.5 * sum
    }
}

/// Acceptance gates for a match. Both must hold: nearest distance at or
/// under `distance`, and derived confidence at or over `confidence`. The
/// double gate keeps a nominally "closest" but weak match out when the
/// gallery is small.
#[derive(Debug, Clone, Copy)]
pub struct MatchThresholds {
    pub distance: f32,
    pub confidence: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            distance: 0.4,
            confidence: 0.85,
        }
    }
}

/// Outcome of matching a probe embedding against a gallery.
///
/// `matched == false` is a legitimate result (unknown person), not an error.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance of the nearest gallery entry, or 1.0 for an empty gallery.
    pub distance: f32,
    /// `max(0, 1 − distance)`, clamped to [0, 1].
    pub confidence: f32,
    pub student_id: Option<String>,
    pub display_name: Option<String>,
}

impl MatchResult {
    fn no_match(best_distance: f32) -> Self {
        Self {
            matched: false,
            distance: best_distance,
            confidence: confidence_from_distance(best_distance),
            student_id: None,
            display_name: None,
        }
    }
}

/// Convert a distance (any non-negative value) to a confidence in [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Strategy for comparing a probe embedding against gallery entries.
///
/// Each [`crate::FaceEncoder`] pairs its encoding with the matcher that
/// understands it; callers never mix the two.
pub trait Matcher: Send + Sync {
    fn compare(
        &self,
        probe: &Embedding,
        entries: &[GalleryEntry],
        thresholds: &MatchThresholds,
    ) -> MatchResult;
}

fn nearest(
    probe: &Embedding,
    entries: &[GalleryEntry],
    distance: impl Fn(&Embedding, &Embedding) -> f32,
    thresholds: &MatchThresholds,
) -> MatchResult {
    let mut best_distance = f32::INFINITY;
    let mut best_idx: Option<usize> = None;

    // Every entry is visited; no early exit on a good match.
    for (i, entry) in entries.iter().enumerate() {
        let d = distance(probe, &entry.embedding);
        if d < best_distance {
            best_distance = d;
            best_idx = Some(i);
        }
    }

    let Some(idx) = best_idx else {
        return MatchResult::no_match(1.0);
    };

    let confidence = confidence_from_distance(best_distance);
    if best_distance <= thresholds.distance && confidence >= thresholds.confidence {
        let entry = &entries[idx];
        MatchResult {
            matched: true,
            distance: best_distance,
            confidence,
            student_id: Some(entry.student_id.clone()),
            display_name: Some(entry.display_name.clone()),
        }
    } else {
        MatchResult::no_match(best_distance)
    }
}

/// Cosine-distance matcher for L2-normalized network embeddings.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        entries: &[GalleryEntry],
        thresholds: &MatchThresholds,
    ) -> MatchResult {
        nearest(probe, entries, Embedding::cosine_distance, thresholds)
    }
}

/// Chi-square matcher for normalized histogram features (classical encoder).
pub struct ChiSquareMatcher;

impl Matcher for ChiSquareMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        entries: &[GalleryEntry],
        thresholds: &MatchThresholds,
    ) -> MatchResult {
        nearest(probe, entries, Embedding::chi_square_distance, thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values, "test")
    }

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            student_id: id.to_string(),
            display_name: format!("Student {id}"),
            embedding: emb(values),
        }
    }

    #[test]
    fn cosine_distance_identical_is_zero() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_orthogonal_is_one() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.cosine_distance(&b), 1.0);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(confidence_from_distance(0.0), 1.0);
        assert_eq!(confidence_from_distance(1.0), 0.0);
        // Distances above 1 (possible with cosine in [0,2]) never go negative.
        assert_eq!(confidence_from_distance(1.7), 0.0);
        assert!((confidence_from_distance(0.25) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn empty_gallery_is_no_match() {
        let probe = emb(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &[], &MatchThresholds::default());
        assert!(!result.matched);
        assert!(result.student_id.is_none());
    }

    #[test]
    fn identical_embedding_matches_with_full_confidence() {
        let probe = emb(vec![0.6, 0.8]);
        let gallery = vec![entry("s1", vec![0.6, 0.8])];
        let result = CosineMatcher.compare(&probe, &gallery, &MatchThresholds::default());
        assert!(result.matched);
        assert!(result.distance.abs() < 1e-6);
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert_eq!(result.student_id.as_deref(), Some("s1"));
    }

    #[test]
    fn selects_nearest_of_many() {
        let probe = emb(vec![1.0, 0.0]);
        let gallery = vec![
            entry("far", vec![0.0, 1.0]),
            entry("near", vec![0.995, 0.1]),
            entry("mid", vec![0.7, 0.7]),
        ];
        let thresholds = MatchThresholds {
            distance: 0.4,
            confidence: 0.6,
        };
        let result = CosineMatcher.compare(&probe, &gallery, &thresholds);
        assert!(result.matched);
        assert_eq!(result.student_id.as_deref(), Some("near"));
    }

    #[test]
    fn distance_exactly_at_threshold_is_accepted() {
        // cos θ = 0.6 → distance = 0.4 exactly.
        let probe = emb(vec![1.0, 0.0]);
        let gallery = vec![entry("s1", vec![0.6, 0.8])];
        let thresholds = MatchThresholds {
            distance: 0.4,
            confidence: 0.6,
        };
        let result = CosineMatcher.compare(&probe, &gallery, &thresholds);
        assert!(result.matched, "distance {} should pass", result.distance);
    }

    #[test]
    fn distance_just_over_threshold_is_rejected() {
        let probe = emb(vec![1.0, 0.0]);
        // cos θ slightly below 0.6 → distance slightly above 0.4.
        let gallery = vec![entry("s1", vec![0.59, 0.807_466])];
        let thresholds = MatchThresholds {
            distance: 0.4,
            confidence: 0.55,
        };
        let result = CosineMatcher.compare(&probe, &gallery, &thresholds);
        assert!(!result.matched, "distance {} should fail", result.distance);
    }

    #[test]
    fn confidence_gate_rejects_even_when_distance_passes() {
        let probe = emb(vec![1.0, 0.0]);
        // distance ≈ 0.1 → confidence ≈ 0.9, below the 0.95 gate.
        let gallery = vec![entry("s1", vec![0.9, 0.435_889_9])];
        let thresholds = MatchThresholds {
            distance: 0.4,
            confidence: 0.95,
        };
        let result = CosineMatcher.compare(&probe, &gallery, &thresholds);
        assert!(!result.matched);
    }

    #[test]
    fn chi_square_identical_histograms_are_zero() {
        let mut h = vec![0.0f32; 8];
        h[0] = 0.5;
        h[3] = 0.5;
        let a = emb(h.clone());
        let b = emb(h);
        assert!(a.chi_square_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn chi_square_disjoint_histograms_are_one() {
        let mut a = vec![0.0f32; 4];
        a[0] = 1.0;
        let mut b = vec![0.0f32; 4];
        b[3] = 1.0;
        let d = emb(a).chi_square_distance(&emb(b));
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_area() {
        let b = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
        };
        assert!((b.area() - 1200.0).abs() < 1e-6);
    }
}
