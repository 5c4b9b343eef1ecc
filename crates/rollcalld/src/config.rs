use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// System-wide config file read when `ROLLCALL_CONFIG` is not set.
const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcalld.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus '{other}', expected 'system' or 'session'")),
        }
    }
}

/// Daemon configuration.
///
/// Layered as: built-in defaults, then the TOML config file (if any), then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database holding students and attendance.
    pub db_path: PathBuf,
    /// SQLite database holding the admin credential.
    pub credential_db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub distance_threshold: f32,
    /// How long a D-Bus call waits for the engine before giving up.
    pub request_timeout_secs: u64,
    /// Lifetime of an unanswered overwrite confirmation.
    pub confirmation_ttl_secs: u64,
    /// Upper bound on a decoded image payload.
    pub max_image_bytes: usize,
    /// Admin password installed when no credential exists yet.
    pub default_admin_password: String,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: rollcall_vision::default_model_dir(),
            db_path: data_dir.join("attendance.db"),
            credential_db_path: data_dir.join("admin.db"),
            distance_threshold: rollcall_core::DEFAULT_DISTANCE_THRESHOLD,
            request_timeout_secs: 10,
            confirmation_ttl_secs: 300,
            max_image_bytes: 16 * 1024 * 1024,
            default_admin_password: "admin123".to_string(),
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load configuration from the config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then_some(default)
        });

        let mut config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "reading config file");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ROLLCALL_*` variables returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_CREDENTIAL_DB_PATH") {
            self.credential_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DEFAULT_ADMIN_PASSWORD") {
            self.default_admin_password = v;
        }
        env_parse(&lookup, "ROLLCALL_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        env_parse(&lookup, "ROLLCALL_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        env_parse(&lookup, "ROLLCALL_CONFIRMATION_TTL_SECS", &mut self.confirmation_ttl_secs);
        env_parse(&lookup, "ROLLCALL_MAX_IMAGE_BYTES", &mut self.max_image_bytes);
        env_parse(&lookup, "ROLLCALL_BUS", &mut self.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.distance_threshold.is_finite() || self.distance_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold must be a positive number, got {}",
                self.distance_threshold
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be > 0".into()));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("max_image_bytes must be > 0".into()));
        }
        if self.default_admin_password.is_empty() {
            return Err(ConfigError::Invalid("default_admin_password must not be empty".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_vision::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_vision::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Parse `key` into `slot` when set; unparsable values are logged and ignored.
fn env_parse<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.distance_threshold, 1.0);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.max_image_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_DISTANCE_THRESHOLD", "0.8"),
            ("ROLLCALL_BUS", "session"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/a.db"),
        ]));
        assert_eq!(config.distance_threshold, 0.8);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/a.db"));
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_REQUEST_TIMEOUT_SECS", "soon"),
            ("ROLLCALL_BUS", "tcp"),
        ]));
        assert_eq!(config.request_timeout_secs, 10);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        for threshold in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let config = Config { distance_threshold: threshold, ..Config::default() };
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{threshold}");
        }
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcalld.toml");
        std::fs::write(&path, "distance_threshold = 0.9\nbus = \"session\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.distance_threshold, 0.9);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_from_file_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcalld.toml");
        std::fs::write(&path, "similarity_threshold = 0.4\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }
}
