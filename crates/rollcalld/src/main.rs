use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod notify;
mod session;
mod store;

use config::Config;
use dbus_interface::RollcallService;
use engine::Engine;
use notify::{Event, Hub, Topic};
use rollcall_core::encoder::load_encoder;
use store::Store;

const BUS_NAME: &str = "org.classroom.Rollcall1";
const OBJECT_PATH: &str = "/org/classroom/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), "store ready");

    let hub = Hub::new();

    // Encoder initialization happens once; a broken primary model falls
    // back to the classical encoder rather than refusing to start.
    let loaded = load_encoder(&config.model_dir, config.detector);
    if loaded.fallback_engaged {
        hub.publish(
            &Topic::System,
            Event::SystemAlert {
                alert_type: "encoder_fallback".into(),
                message: "primary encoder unavailable; running on classical fallback".into(),
                severity: "warning".into(),
            },
        );
    }
    tracing::info!(
        encoder = loaded.encoder.model_tag(),
        fallback = loaded.fallback_engaged,
        "encoder ready"
    );

    let session_bus = config.session_bus;
    let engine = Engine::new(&config, store, hub, loaded).context("building engine")?;

    let service = RollcallService { engine };
    let builder = if session_bus {
        tracing::info!("connecting to session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
