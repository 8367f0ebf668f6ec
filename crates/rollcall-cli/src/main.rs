use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration CLI")]
struct Cli {
    /// Use the session bus instead of the system bus (development mode).
    #[arg(long)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Open a pending session for recognition
    OpenSession {
        /// Session ID
        id: String,
    },
    /// Close an active session (terminal)
    CloseSession {
        /// Session ID
        id: String,
    },
    /// Enroll a student's face template from a photo
    Enroll {
        /// Student ID
        student_id: String,
        /// Path to the photo file (PNG or JPEG)
        photo: PathBuf,
    },
    /// Submit one recognition frame for a session
    Recognize {
        /// Session ID
        session_id: String,
        /// Path to the captured frame
        image: PathBuf,
    },
    /// Mark a student present manually
    Mark {
        /// Session ID
        session_id: String,
        /// Student ID
        student_id: String,
    },
    /// List attendance records for a session
    Attendance {
        /// Session ID
        session_id: String,
    },
}

#[zbus::proxy(
    interface = "org.classroom.Rollcall1",
    default_service = "org.classroom.Rollcall1",
    default_path = "/org/classroom/Rollcall1"
)]
trait Rollcall {
    async fn status(&self) -> zbus::Result<String>;
    async fn open_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn close_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn enroll_student(&self, student_id: &str, photo_b64: &str) -> zbus::Result<String>;
    async fn recognize_attendance(&self, session_id: &str, image_b64: &str)
        -> zbus::Result<String>;
    async fn mark_manual(&self, session_id: &str, student_id: &str) -> zbus::Result<String>;
    async fn list_attendance(&self, session_id: &str) -> zbus::Result<String>;
}

fn read_as_base64(path: &PathBuf) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

/// Re-indent a JSON reply for the terminal; pass through anything else.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus — is rollcalld running?")?;
    let proxy = RollcallProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Status => proxy.status().await?,
        Commands::OpenSession { id } => proxy.open_session(&id).await?,
        Commands::CloseSession { id } => proxy.close_session(&id).await?,
        Commands::Enroll { student_id, photo } => {
            let payload = read_as_base64(&photo)?;
            proxy.enroll_student(&student_id, &payload).await?
        }
        Commands::Recognize { session_id, image } => {
            let payload = read_as_base64(&image)?;
            proxy.recognize_attendance(&session_id, &payload).await?
        }
        Commands::Mark {
            session_id,
            student_id,
        } => proxy.mark_manual(&session_id, &student_id).await?,
        Commands::Attendance { session_id } => proxy.list_attendance(&session_id).await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}
