//! SQLite-backed storage: identities, courses, sessions and attendance.
//!
//! Embedding blobs are encoded with the versioned codec and encrypted with
//! AES-256-GCM before they touch disk. The attendance table's
//! `UNIQUE(student_id, session_id)` constraint is the source of truth for
//! at-most-once recording — duplicate detection happens at the durable
//! write, not in a pre-check, so it holds under concurrent submissions and
//! across process restarts.

use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio_rusqlite::Connection;

use rollcall_core::codec::{self, CodecError};
use rollcall_core::types::Embedding;
use rollcall_core::GalleryEntry;

use crate::session::{SessionError, SessionState};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding codec: {0}")]
    Codec(#[from] CodecError),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("student not found: {0}")]
    StudentNotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// How an attendance record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Recognition,
    Manual,
    Card,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Manual => "manual",
            Self::Card => "card",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "card" => Self::Card,
            _ => Self::Recognition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub display_name: String,
    pub session_id: String,
    pub recorded_at: String,
    pub confidence: f64,
    pub method: Method,
}

/// Result of the conditional attendance insert.
#[derive(Debug)]
pub enum RecordOutcome {
    Recorded(AttendanceRecord),
    AlreadyMarked,
}

/// One line of the dashboard recent-activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub attendance_id: String,
    pub student_name: String,
    pub session_name: String,
    pub recorded_at: String,
    pub confidence: f64,
}

enum TransitionOutcome {
    Updated(SessionRow),
    Missing,
    WrongState(String),
}

#[derive(Clone)]
pub struct Store {
    conn: Connection,
    enc_key: [u8; 32],
}

impl Store {
    /// Open (or create) the database and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key.
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/rollcall"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS students (
                     id TEXT PRIMARY KEY,
                     student_no TEXT NOT NULL UNIQUE,
                     display_name TEXT NOT NULL,
                     embedding BLOB,
                     embedding_quality REAL,
                     model_tag TEXT,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS courses (
                     id TEXT PRIMARY KEY,
                     code TEXT NOT NULL UNIQUE,
                     name TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS enrollments (
                     student_id TEXT NOT NULL REFERENCES students(id),
                     course_id TEXT NOT NULL REFERENCES courses(id),
                     active INTEGER NOT NULL DEFAULT 1,
                     UNIQUE(student_id, course_id)
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                     id TEXT PRIMARY KEY,
                     course_id TEXT NOT NULL REFERENCES courses(id),
                     name TEXT NOT NULL,
                     starts_at TEXT NOT NULL,
                     ends_at TEXT NOT NULL,
                     state TEXT NOT NULL DEFAULT 'pending'
                         CHECK (state IN ('pending', 'active', 'closed'))
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     student_id TEXT NOT NULL REFERENCES students(id),
                     session_id TEXT NOT NULL REFERENCES sessions(id),
                     recorded_at TEXT NOT NULL,
                     confidence REAL NOT NULL,
                     method TEXT NOT NULL,
                     verified_by TEXT,
                     note TEXT,
                     UNIQUE(student_id, session_id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_session
                     ON attendance(session_id);
                 CREATE INDEX IF NOT EXISTS idx_attendance_recorded_at
                     ON attendance(recorded_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    // ── Identities ────────────────────────────────────────────────────────

    pub async fn add_student(
        &self,
        student_no: &str,
        display_name: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let student_no = student_no.to_string();
        let display_name = display_name.to_string();
        let now = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, student_no, display_name, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, student_no, display_name, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    pub async fn add_course(&self, code: &str, name: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let code = code.to_string();
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO courses (id, code, name) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, code, name],
                )?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    pub async fn enroll_student(
        &self,
        student_id: &str,
        course_id: &str,
    ) -> Result<(), StoreError> {
        let student_id = student_id.to_string();
        let course_id = course_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO enrollments (student_id, course_id, active) VALUES (?1, ?2, 1)
                     ON CONFLICT(student_id, course_id) DO UPDATE SET active = 1",
                    rusqlite::params![student_id, course_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Replace a student's stored embedding in one atomic write.
    pub async fn set_student_embedding(
        &self,
        student_id: &str,
        embedding: &Embedding,
        quality: f32,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_blob(&codec::encode_embedding(embedding)?)?;
        let model_tag = embedding.model_tag.clone();
        let student_id_owned = student_id.to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let affected = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE students
                     SET embedding = ?1, embedding_quality = ?2, model_tag = ?3, updated_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![blob, quality as f64, model_tag, now, student_id_owned],
                )?;
                Ok(affected)
            })
            .await?;

        if affected == 0 {
            return Err(StoreError::StudentNotFound(student_id.to_string()));
        }
        Ok(())
    }

    /// Enrolled, encoded identities for one course — the raw material for a
    /// gallery snapshot. Entries produced by a different encoder are
    /// skipped (they live in an incomparable embedding space).
    pub async fn gallery_entries(
        &self,
        course_id: &str,
        model_tag: &str,
    ) -> Result<Vec<GalleryEntry>, StoreError> {
        let course_id = course_id.to_string();
        let rows: Vec<(String, String, Vec<u8>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.display_name, s.embedding
                     FROM students s
                     JOIN enrollments e ON e.student_id = s.id
                     WHERE e.course_id = ?1 AND e.active = 1 AND s.embedding IS NOT NULL",
                )?;
                let rows = stmt.query_map([&course_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for (student_id, display_name, blob) in rows {
            let embedding = codec::decode_embedding(&self.decrypt_blob(&blob)?)?;
            if embedding.model_tag != model_tag {
                skipped += 1;
                continue;
            }
            entries.push(GalleryEntry {
                student_id,
                display_name,
                embedding,
            });
        }
        if skipped > 0 {
            tracing::warn!(
                skipped,
                model_tag,
                "gallery build skipped templates from a different encoder; re-enrollment needed"
            );
        }
        Ok(entries)
    }

    /// Courses a student is actively enrolled in — the galleries a new
    /// template makes stale.
    pub async fn courses_for_student(&self, student_id: &str) -> Result<Vec<String>, StoreError> {
        let student_id = student_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT course_id FROM enrollments WHERE student_id = ?1 AND active = 1",
                )?;
                let rows = stmt.query_map([&student_id], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count of students with a usable stored template.
    pub async fn count_templates(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM students WHERE embedding IS NOT NULL",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        course_id: &str,
        name: &str,
        starts_at: &str,
        ends_at: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let course_id = course_id.to_string();
        let name = name.to_string();
        let starts_at = starts_at.to_string();
        let ends_at = ends_at.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, course_id, name, starts_at, ends_at, state)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
                    rusqlite::params![id, course_id, name, starts_at, ends_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRow>, StoreError> {
        let session_id = session_id.to_string();
        let row: Option<(String, String, String, String)> = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, course_id, name, state FROM sessions WHERE id = ?1",
                        [&session_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(row)
            })
            .await?;

        row.map(|(id, course_id, name, state)| {
            Ok(SessionRow {
                id,
                course_id,
                name,
                state: SessionState::parse(&state)?,
            })
        })
        .transpose()
    }

    pub async fn open_session(&self, session_id: &str) -> Result<SessionRow, StoreError> {
        self.transition(session_id, SessionState::Pending, SessionState::Active)
            .await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<SessionRow, StoreError> {
        self.transition(session_id, SessionState::Active, SessionState::Closed)
            .await
    }

    /// Conditional state move: the UPDATE only fires from the expected
    /// state, so a raced duplicate transition loses cleanly.
    async fn transition(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<SessionRow, StoreError> {
        let id = session_id.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE sessions SET state = ?1 WHERE id = ?2 AND state = ?3",
                    rusqlite::params![to.as_str(), id, from.as_str()],
                )?;
                if affected == 0 {
                    let current: Option<String> = conn
                        .query_row("SELECT state FROM sessions WHERE id = ?1", [&id], |row| {
                            row.get(0)
                        })
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    return Ok(match current {
                        None => TransitionOutcome::Missing,
                        Some(state) => TransitionOutcome::WrongState(state),
                    });
                }

                let row = conn.query_row(
                    "SELECT id, course_id, name, state FROM sessions WHERE id = ?1",
                    [&id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )?;
                Ok(TransitionOutcome::Updated(SessionRow {
                    id: row.0,
                    course_id: row.1,
                    name: row.2,
                    state: SessionState::parse(&row.3).unwrap_or(to),
                }))
            })
            .await?;

        match outcome {
            TransitionOutcome::Updated(row) => Ok(row),
            TransitionOutcome::Missing => {
                Err(SessionError::NotFound(session_id.to_string()).into())
            }
            TransitionOutcome::WrongState(state) => {
                let current = SessionState::parse(&state)?;
                Err(current.transition_error(to).into())
            }
        }
    }

    // ── Attendance ────────────────────────────────────────────────────────

    /// At-most-once attendance write. The `UNIQUE(student_id, session_id)`
    /// constraint decides; a conflicting concurrent insert observes
    /// `AlreadyMarked` rather than an error.
    pub async fn record_attendance(
        &self,
        student_id: &str,
        session_id: &str,
        confidence: f32,
        method: Method,
    ) -> Result<RecordOutcome, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let recorded_at = chrono::Utc::now().to_rfc3339();
        let student = student_id.to_string();
        let session = session_id.to_string();

        let recorded: Option<AttendanceRecord> = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT INTO attendance
                         (id, student_id, session_id, recorded_at, confidence, method)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(student_id, session_id) DO NOTHING",
                    rusqlite::params![
                        id,
                        student,
                        session,
                        recorded_at,
                        confidence as f64,
                        method.as_str()
                    ],
                )?;
                if affected == 0 {
                    return Ok(None);
                }

                let display_name: String = conn.query_row(
                    "SELECT display_name FROM students WHERE id = ?1",
                    [&student],
                    |row| row.get(0),
                )?;
                Ok(Some(AttendanceRecord {
                    id,
                    student_id: student,
                    display_name,
                    session_id: session,
                    recorded_at,
                    confidence: confidence as f64,
                    method,
                }))
            })
            .await?;

        Ok(match recorded {
            Some(record) => RecordOutcome::Recorded(record),
            None => RecordOutcome::AlreadyMarked,
        })
    }

    /// Attach a human verification annotation to an existing record — the
    /// only mutation attendance rows ever see.
    pub async fn verify_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        verified_by: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        let verified_by = verified_by.to_string();
        let note = note.map(|s| s.to_string());

        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE attendance SET verified_by = ?1, note = ?2
                     WHERE session_id = ?3 AND student_id = ?4",
                    rusqlite::params![verified_by, note, session_id, student_id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn attendance_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.student_id, s.display_name, a.session_id,
                            a.recorded_at, a.confidence, a.method
                     FROM attendance a
                     JOIN students s ON s.id = a.student_id
                     WHERE a.session_id = ?1
                     ORDER BY a.recorded_at DESC",
                )?;
                let rows = stmt.query_map([&session_id], |row| {
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        student_id: row.get(1)?,
                        display_name: row.get(2)?,
                        session_id: row.get(3)?,
                        recorded_at: row.get(4)?,
                        confidence: row.get(5)?,
                        method: Method::parse(&row.get::<_, String>(6)?),
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Today's running count plus the most recent records, for dashboard
    /// subscribers.
    pub async fn dashboard_stats(
        &self,
        recent_limit: usize,
    ) -> Result<(u64, Vec<ActivityItem>), StoreError> {
        let today_start = format!("{}T00:00:00+00:00", chrono::Utc::now().date_naive());
        self.conn
            .call(move |conn| {
                let today: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE recorded_at >= ?1",
                    [&today_start],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT a.id, s.display_name, se.name, a.recorded_at, a.confidence
                     FROM attendance a
                     JOIN students s ON s.id = a.student_id
                     JOIN sessions se ON se.id = a.session_id
                     ORDER BY a.recorded_at DESC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map([recent_limit as i64], |row| {
                    Ok(ActivityItem {
                        attendance_id: row.get(0)?,
                        student_name: row.get(1)?,
                        session_name: row.get(2)?,
                        recorded_at: row.get(3)?,
                        confidence: row.get(4)?,
                    })
                })?;
                Ok((today, rows.collect::<Result<Vec<_>, _>>()?))
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_blob(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        const NONCE_LEN: usize = 12;
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

// ── Key management ────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// with mode 0600.
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
