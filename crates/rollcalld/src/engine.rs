//! The attendance recognition engine.
//!
//! One explicit context object, built at startup and shared by handle:
//! encoder, matcher, quality assessor, liveness detector, gallery cache,
//! store and notification hub. Each submitted frame is an independent unit
//! of work — the CPU-bound stages run on the blocking pool, and the only
//! serialization point is the store's uniqueness constraint on the
//! attendance write.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task;

use rollcall_core::encoder::{primary_face, EncoderError, FaceEncoder, LoadedEncoder};
use rollcall_core::quality::{QualityAssessor, QualityConfigError, QualityScores};
use rollcall_core::types::{MatchThresholds, Matcher};
use rollcall_core::{Gallery, GalleryCache, LivenessDetector, PixelBuffer};

use crate::config::Config;
use crate::notify::{Event, Hub, Topic};
use crate::session::{SessionError, SessionState};
use crate::store::{Method, RecordOutcome, SessionRow, Store, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("recognition task aborted")]
    TaskAborted,
}

/// Why a frame was turned away. These travel in the reply, with the
/// diagnostics the caller needs to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    InvalidImageFormat,
    NoFaceDetected,
    LowQuality,
    SpoofSuspected,
    NoMatch,
    SessionNotStarted,
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Marked,
    AlreadyMarked,
    Rejected,
}

#[derive(Debug, Serialize)]
pub struct RecognitionReply {
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded_faces: Option<usize>,
}

impl RecognitionReply {
    fn rejected(reason: Rejection) -> Self {
        Self {
            status: ReplyStatus::Rejected,
            reason: Some(reason),
            student_id: None,
            display_name: None,
            confidence: None,
            quality: None,
            discarded_faces: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnrollReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
}

/// Result of the gated image pipeline, before any gallery work.
enum Gated {
    Rejected {
        reason: Rejection,
        quality: Option<QualityScores>,
        discarded: Option<usize>,
    },
    Accepted {
        embedding: rollcall_core::Embedding,
        quality: QualityScores,
        discarded: usize,
    },
}

struct EngineInner {
    store: Store,
    hub: Hub,
    encoder: Arc<dyn FaceEncoder>,
    matcher: Box<dyn Matcher>,
    quality: QualityAssessor,
    liveness: LivenessDetector,
    galleries: GalleryCache,
    thresholds: MatchThresholds,
    quality_min_recognize: f32,
    quality_min_enroll: f32,
    recent_feed_size: usize,
    fallback_engaged: bool,
}

/// Clone-cheap handle to the shared recognition context.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Store,
        hub: Hub,
        loaded: LoadedEncoder,
    ) -> Result<Self, QualityConfigError> {
        let matcher = loaded.encoder.matcher();
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                hub,
                encoder: loaded.encoder,
                matcher,
                quality: QualityAssessor::new(config.quality_weights)?,
                liveness: LivenessDetector::new(config.liveness),
                galleries: GalleryCache::new(),
                thresholds: config.thresholds,
                quality_min_recognize: config.quality_min_recognize,
                quality_min_enroll: config.quality_min_enroll,
                recent_feed_size: config.recent_feed_size,
                fallback_engaged: loaded.fallback_engaged,
            }),
        })
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn model_tag(&self) -> String {
        self.inner.encoder.model_tag().to_string()
    }

    pub fn fallback_engaged(&self) -> bool {
        self.inner.fallback_engaged
    }

    /// Full recognition flow for one submitted frame.
    pub async fn recognize(
        &self,
        session_id: &str,
        image_payload: String,
    ) -> Result<RecognitionReply, EngineError> {
        // Gate first — state is read per request, so frames submitted after
        // a close uniformly reject while in-flight ones complete.
        let session = self.require_session(session_id).await?;
        match session.state {
            SessionState::Pending => {
                return Ok(RecognitionReply::rejected(Rejection::SessionNotStarted))
            }
            SessionState::Closed => {
                return Ok(RecognitionReply::rejected(Rejection::SessionEnded))
            }
            SessionState::Active => {}
        }

        let gated = self
            .run_pipeline(image_payload, self.inner.quality_min_recognize)
            .await?;
        let (embedding, quality, discarded) = match gated {
            Gated::Rejected {
                reason,
                quality,
                discarded,
            } => {
                return Ok(RecognitionReply {
                    quality,
                    discarded_faces: discarded,
                    ..RecognitionReply::rejected(reason)
                })
            }
            Gated::Accepted {
                embedding,
                quality,
                discarded,
            } => (embedding, quality, discarded),
        };

        let gallery = self.gallery_for(&session.course_id).await?;
        let result = self
            .inner
            .matcher
            .compare(&embedding, &gallery.entries, &self.inner.thresholds);

        let Some(student_id) = result.student_id.filter(|_| result.matched) else {
            tracing::info!(
                session = %session.id,
                distance = result.distance,
                gallery_size = gallery.entries.len(),
                "no gallery entry within thresholds"
            );
            return Ok(RecognitionReply {
                quality: Some(quality),
                discarded_faces: nonzero(discarded),
                ..RecognitionReply::rejected(Rejection::NoMatch)
            });
        };

        let outcome = self
            .inner
            .store
            .record_attendance(&student_id, &session.id, result.confidence, Method::Recognition)
            .await?;

        let status = match outcome {
            RecordOutcome::Recorded(record) => {
                tracing::info!(
                    session = %session.id,
                    student = %record.display_name,
                    confidence = result.confidence,
                    "attendance recorded"
                );
                self.publish_attendance(record).await;
                ReplyStatus::Marked
            }
            RecordOutcome::AlreadyMarked => {
                tracing::debug!(session = %session.id, student = %student_id, "already marked");
                ReplyStatus::AlreadyMarked
            }
        };

        Ok(RecognitionReply {
            status,
            reason: None,
            student_id: Some(student_id),
            display_name: result.display_name,
            confidence: Some(result.confidence),
            quality: Some(quality),
            discarded_faces: nonzero(discarded),
        })
    }

    /// Produce and store a student's template from an enrollment photo.
    pub async fn enroll(
        &self,
        student_id: &str,
        photo_payload: String,
    ) -> Result<EnrollReply, EngineError> {
        let gated = self
            .run_pipeline(photo_payload, self.inner.quality_min_enroll)
            .await?;
        let (embedding, quality) = match gated {
            Gated::Rejected {
                reason, quality, ..
            } => {
                return Ok(EnrollReply {
                    success: false,
                    quality_score: quality.map(|q| q.overall),
                    reason: Some(reason),
                })
            }
            Gated::Accepted {
                embedding, quality, ..
            } => (embedding, quality),
        };

        self.inner
            .store
            .set_student_embedding(student_id, &embedding, quality.overall)
            .await?;

        // The new template makes any gallery containing (or now gaining)
        // this student stale.
        for course_id in self.inner.store.courses_for_student(student_id).await? {
            self.inner.galleries.invalidate_course(&course_id);
        }

        tracing::info!(student = %student_id, quality = quality.overall, "enrollment updated");
        Ok(EnrollReply {
            success: true,
            quality_score: Some(quality.overall),
            reason: None,
        })
    }

    pub async fn open_session(&self, session_id: &str) -> Result<SessionRow, EngineError> {
        let row = self.inner.store.open_session(session_id).await?;
        self.publish_session_update(&row);
        Ok(row)
    }

    pub async fn close_session(&self, session_id: &str) -> Result<SessionRow, EngineError> {
        let row = self.inner.store.close_session(session_id).await?;
        self.publish_session_update(&row);
        Ok(row)
    }

    /// Manual fallback marking by an instructor.
    pub async fn mark_manual(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<RecognitionReply, EngineError> {
        let session = self.require_session(session_id).await?;
        match session.state {
            SessionState::Pending => {
                return Ok(RecognitionReply::rejected(Rejection::SessionNotStarted))
            }
            SessionState::Closed => {
                return Ok(RecognitionReply::rejected(Rejection::SessionEnded))
            }
            SessionState::Active => {}
        }

        let outcome = self
            .inner
            .store
            .record_attendance(student_id, &session.id, 1.0, Method::Manual)
            .await?;
        let (status, display_name) = match outcome {
            RecordOutcome::Recorded(record) => {
                let name = record.display_name.clone();
                self.publish_attendance(record).await;
                (ReplyStatus::Marked, Some(name))
            }
            RecordOutcome::AlreadyMarked => (ReplyStatus::AlreadyMarked, None),
        };

        Ok(RecognitionReply {
            status,
            reason: None,
            student_id: Some(student_id.to_string()),
            display_name,
            confidence: Some(1.0),
            quality: None,
            discarded_faces: None,
        })
    }

    async fn require_session(&self, session_id: &str) -> Result<SessionRow, EngineError> {
        self.inner
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| StoreError::Session(SessionError::NotFound(session_id.into())).into())
    }

    /// Decode → detect → quality → liveness → encode, on the blocking pool.
    async fn run_pipeline(
        &self,
        payload: String,
        quality_min: f32,
    ) -> Result<Gated, EngineError> {
        let encoder = Arc::clone(&self.inner.encoder);
        let quality = self.inner.quality;
        let liveness = self.inner.liveness;

        task::spawn_blocking(move || -> Result<Gated, EncoderError> {
            let image = match PixelBuffer::from_base64_payload(&payload) {
                Ok(image) => image,
                Err(e) => {
                    tracing::debug!(error = %e, "frame rejected at decode");
                    return Ok(Gated::Rejected {
                        reason: Rejection::InvalidImageFormat,
                        quality: None,
                        discarded: None,
                    });
                }
            };

            let faces = encoder.detect(&image)?;
            let Some((face, discarded)) = primary_face(&faces) else {
                return Ok(Gated::Rejected {
                    reason: Rejection::NoFaceDetected,
                    quality: None,
                    discarded: None,
                });
            };
            if discarded > 0 {
                tracing::debug!(discarded, "multiple faces detected, using largest");
            }

            let crop = image.crop_face(face);
            let scores = quality.assess(&crop, face);
            if scores.overall < quality_min {
                return Ok(Gated::Rejected {
                    reason: Rejection::LowQuality,
                    quality: Some(scores),
                    discarded: nonzero(discarded),
                });
            }

            if liveness.enabled() {
                let check = liveness.check(&crop);
                if !check.is_live() {
                    tracing::warn!(
                        failed = ?check.failed_check,
                        skin_ratio = check.skin_ratio,
                        texture_variance = check.texture_variance,
                        edge_density = check.edge_density,
                        "spoof suspected"
                    );
                    return Ok(Gated::Rejected {
                        reason: Rejection::SpoofSuspected,
                        quality: Some(scores),
                        discarded: nonzero(discarded),
                    });
                }
            }

            let embedding = encoder.encode(&crop)?;
            Ok(Gated::Accepted {
                embedding,
                quality: scores,
                discarded,
            })
        })
        .await
        .map_err(|_| EngineError::TaskAborted)?
        .map_err(EngineError::from)
    }

    /// Cached gallery snapshot for a course, rebuilt from the store on miss.
    async fn gallery_for(&self, course_id: &str) -> Result<Arc<Gallery>, EngineError> {
        if let Some(snapshot) = self.inner.galleries.get(course_id) {
            return Ok(snapshot);
        }

        let tag = self.inner.encoder.model_tag().to_string();
        let entries = self.inner.store.gallery_entries(course_id, &tag).await?;
        tracing::debug!(course = %course_id, entries = entries.len(), "gallery rebuilt");
        Ok(self
            .inner
            .galleries
            .install(Gallery::new(course_id, tag, entries)))
    }

    /// Fan-out after a durable attendance write. Best-effort only: a failed
    /// stats query is logged, never surfaced.
    async fn publish_attendance(&self, record: crate::store::AttendanceRecord) {
        let session_topic = Topic::Session(record.session_id.clone());
        self.inner
            .hub
            .publish(&session_topic, Event::AttendanceEvent { attendance: record });

        match self
            .inner
            .store
            .dashboard_stats(self.inner.recent_feed_size)
            .await
        {
            Ok((today_count, recent_activity)) => {
                self.inner.hub.publish(
                    &Topic::Dashboard,
                    Event::DashboardUpdate {
                        today_count,
                        recent_activity,
                    },
                );
            }
            Err(e) => tracing::warn!(error = %e, "dashboard stats unavailable, update skipped"),
        }
    }

    fn publish_session_update(&self, row: &SessionRow) {
        self.inner.hub.publish(
            &Topic::Session(row.id.clone()),
            Event::SessionUpdate {
                session_id: row.id.clone(),
                state: row.state.as_str(),
            },
        );
    }
}

fn nonzero(n: usize) -> Option<usize> {
    (n > 0).then_some(n)
}
