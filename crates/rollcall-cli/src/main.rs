use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, name: &str, mobile: &str, email: &str, image: &str) -> zbus::Result<String>;
    async fn confirm_update(&self, token: &str) -> zbus::Result<String>;
    async fn reject_update(&self, token: &str) -> zbus::Result<String>;
    async fn update_face(&self, name: &str, image: &str) -> zbus::Result<String>;
    async fn recognize(&self, image: &str) -> zbus::Result<String>;
    async fn verify_password(&self, password: &str) -> zbus::Result<String>;
    async fn update_password(&self, old_password: &str, new_password: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn attendance(&self, date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Seconds to wait for the daemon to answer
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a photo containing exactly one face
    Enroll {
        name: String,
        image: PathBuf,
        #[arg(long)]
        mobile: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Confirm a pending facial-data overwrite
    Confirm { token: String },
    /// Discard a pending facial-data overwrite
    Reject { token: String },
    /// Replace an enrolled student's facial data
    UpdateFace { name: String, image: PathBuf },
    /// Recognize faces in a photo and record attendance
    Recognize { image: PathBuf },
    /// List enrolled students
    Students,
    /// Show attendance for a day (YYYY-MM-DD, default today)
    Attendance { date: Option<String> },
    /// Check the admin password
    Verify { password: String },
    /// Change the admin password
    Passwd { old: String, new: String },
    /// Show daemon status
    Status,
}

/// Read an image file into a `data:` URL, sniffing the MIME type.
fn image_data_url(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    tracing::debug!(path = %path.display(), mime, bytes = bytes.len(), "image loaded");
    Ok(format!("data:{mime};base64,{}", STANDARD.encode(&bytes)))
}

/// Pretty-print the daemon's JSON reply; non-2xx replies exit non-zero.
fn print_reply(reply: &str) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    match body["status"].as_u64() {
        Some(status) if (200..300).contains(&status) => Ok(()),
        Some(status) => anyhow::bail!("request failed with status {status}"),
        None => anyhow::bail!("reply has no status"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(cli.timeout))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Enroll { name, image, mobile, email } => {
            let image = image_data_url(&image)?;
            proxy
                .enroll(&name, mobile.as_deref().unwrap_or(""), email.as_deref().unwrap_or(""), &image)
                .await?
        }
        Commands::Confirm { token } => proxy.confirm_update(&token).await?,
        Commands::Reject { token } => proxy.reject_update(&token).await?,
        Commands::UpdateFace { name, image } => {
            proxy.update_face(&name, &image_data_url(&image)?).await?
        }
        Commands::Recognize { image } => proxy.recognize(&image_data_url(&image)?).await?,
        Commands::Students => proxy.list_students().await?,
        Commands::Attendance { date } => proxy.attendance(date.as_deref().unwrap_or("")).await?,
        Commands::Verify { password } => proxy.verify_password(&password).await?,
        Commands::Passwd { old, new } => proxy.update_password(&old, &new).await?,
        Commands::Status => proxy.status().await?,
    };

    print_reply(&reply)
}
