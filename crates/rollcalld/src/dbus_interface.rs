//! D-Bus surface for the attendance daemon.
//!
//! Bus name: org.classroom.Rollcall1
//! Object path: /org/classroom/Rollcall1
//!
//! A thin wrapper over [`Engine`]: domain outcomes (rejections, duplicate
//! marks) travel inside the JSON reply; only infrastructure failures become
//! D-Bus errors.

use zbus::interface;

use crate::engine::Engine;

pub struct RollcallService {
    pub engine: Engine,
}

fn to_fdo(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.classroom.Rollcall1")]
impl RollcallService {
    /// Run one recognition attempt for a session. `image_b64` is a base64
    /// image payload, with or without a data-URI prefix. Returns the
    /// recognition reply as JSON.
    async fn recognize_attendance(
        &self,
        session_id: &str,
        image_b64: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::debug!(session = %session_id, "recognize requested");
        let reply = self
            .engine
            .recognize(session_id, image_b64.to_string())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, session = %session_id, "recognize failed");
                to_fdo(e)
            })?;
        serde_json::to_string(&reply).map_err(to_fdo)
    }

    /// Enroll (or re-enroll) a student's face template from a photo.
    async fn enroll_student(
        &self,
        student_id: &str,
        photo_b64: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(student = %student_id, "enroll requested");
        let reply = self
            .engine
            .enroll(student_id, photo_b64.to_string())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, student = %student_id, "enroll failed");
                to_fdo(e)
            })?;
        serde_json::to_string(&reply).map_err(to_fdo)
    }

    /// Open a pending session for recognition.
    async fn open_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = %session_id, "open requested");
        let row = self.engine.open_session(session_id).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "session_id": row.id,
            "state": row.state.as_str(),
        })
        .to_string())
    }

    /// Close an active session. Terminal: no further attendance writes.
    async fn close_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = %session_id, "close requested");
        let row = self.engine.close_session(session_id).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "session_id": row.id,
            "state": row.state.as_str(),
        })
        .to_string())
    }

    /// Mark a student manually (instructor override).
    async fn mark_manual(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(session = %session_id, student = %student_id, "manual mark requested");
        let reply = self
            .engine
            .mark_manual(session_id, student_id)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&reply).map_err(to_fdo)
    }

    /// Attach a human verification annotation to an attendance record.
    async fn verify_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        verified_by: &str,
        note: &str,
    ) -> zbus::fdo::Result<bool> {
        let note = (!note.is_empty()).then_some(note);
        self.engine
            .store()
            .verify_attendance(session_id, student_id, verified_by, note)
            .await
            .map_err(to_fdo)
    }

    /// Attendance list for a session as JSON.
    async fn list_attendance(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let records = self
            .engine
            .store()
            .attendance_for_session(session_id)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&records).map_err(to_fdo)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let templates = self
            .engine
            .store()
            .count_templates()
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "encoder": self.engine.model_tag(),
            "fallback_engaged": self.engine.fallback_engaged(),
            "templates_enrolled": templates,
        })
        .to_string())
    }
}
