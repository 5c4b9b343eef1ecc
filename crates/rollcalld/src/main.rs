use anyhow::{Context, Result};
use rollcall_vision::{FaceDetector, FaceRecognizer};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod credential;
mod dbus_interface;
mod engine;
mod store;
#[cfg(test)]
mod testing;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.distance_threshold,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = store::SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let credentials = credential::SqliteCredentialStore::open(&config.credential_db_path)
        .with_context(|| format!("failed to open {}", config.credential_db_path.display()))?;
    if credentials.bootstrap(&config.default_admin_password)? {
        tracing::warn!("admin credential initialized with the default password; change it");
    }

    let detector = FaceDetector::load(&config.scrfd_model_path())
        .context("failed to load face detector")?;
    let recognizer = FaceRecognizer::load(&config.arcface_model_path())
        .context("failed to load face recognizer")?;
    tracing::info!("models loaded");

    let settings = engine::EngineSettings::from_config(&config);
    let handle = engine::spawn_engine(detector, recognizer, store, credentials, settings)?;

    let service = dbus_interface::AttendanceService { engine: handle };
    let builder = match config.bus {
        config::BusKind::System => zbus::connection::Builder::system()?,
        config::BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME}"))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
