//! Per-course galleries of enrolled embeddings.
//!
//! A [`Gallery`] is an immutable snapshot, derived from identity records and
//! rebuildable at any time. The cache swaps whole snapshots behind an `Arc`;
//! readers that already hold one keep matching against a consistent view
//! while a rebuild installs its replacement.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::types::Embedding;

/// One enrolled identity inside a course gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student_id: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Immutable nearest-neighbor index for one course's active enrollment.
#[derive(Debug, Clone)]
pub struct Gallery {
    pub course_id: String,
    /// Encoder tag the entries were produced with; mixed-tag entries are
    /// filtered out at build time.
    pub model_tag: String,
    pub entries: Vec<GalleryEntry>,
    pub built_at: DateTime<Utc>,
}

impl Gallery {
    pub fn new(course_id: impl Into<String>, model_tag: impl Into<String>, entries: Vec<GalleryEntry>) -> Self {
        Self {
            course_id: course_id.into(),
            model_tag: model_tag.into(),
            entries,
            built_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared cache of gallery snapshots, keyed by course.
///
/// Never mutated in place: installs replace the `Arc` under a short write
/// lock, and readers clone the `Arc` out under a read lock.
#[derive(Debug, Clone, Default)]
pub struct GalleryCache {
    inner: Arc<RwLock<HashMap<String, Arc<Gallery>>>>,
}

impl GalleryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, course_id: &str) -> Option<Arc<Gallery>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(course_id)
            .cloned()
    }

    /// Install a freshly built snapshot, replacing any previous one.
    pub fn install(&self, gallery: Gallery) -> Arc<Gallery> {
        let snapshot = Arc::new(gallery);
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.course_id.clone(), Arc::clone(&snapshot));
        snapshot
    }

    /// Drop the snapshot for one course, forcing a rebuild on next use.
    pub fn invalidate_course(&self, course_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(course_id);
    }

    /// Drop every snapshot containing the given student. Called after an
    /// enrollment updates that student's embedding.
    pub fn invalidate_student(&self, student_id: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, gallery| {
            !gallery
                .entries
                .iter()
                .any(|entry| entry.student_id == student_id)
        });
    }
}
