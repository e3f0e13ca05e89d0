use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Entry URL handed to the worker when the config file does not override it.
pub const DEFAULT_ENTRY_URL: &str = "https://emas3.ui.ac.id/login/index.php";

/// Top-level server settings, loaded from TOML.
///
/// Every table and key is optional; missing values fall back to the
/// defaults below. Command-line flags are applied on top by `main`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub worker: WorkerSettings,
}

/// `[server]` table: listener and HTTP layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind the HTTP API.
    pub bind: SocketAddr,
    /// Root for per-session artifact directories (`<data_dir>/downloads/<id>`).
    pub data_dir: PathBuf,
    /// Extra origins allowed by CORS. Empty disables the CORS layer.
    pub cors_origins: Vec<String>,
    /// Per-IP requests per second. `None` disables rate limiting.
    pub rate_limit: Option<u32>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("data"),
            cors_origins: Vec::new(),
            rate_limit: None,
        }
    }
}

impl ServerSettings {
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

/// `[session]` table: identifier carriage and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle time after which a session is evicted.
    pub ttl_secs: u64,
    /// Interval between garbage-collection sweeps.
    pub sweep_interval_secs: u64,
    pub cookie_name: String,
    pub header_name: String,
    pub query_param: String,
    /// Add the `Secure` attribute to the session cookie.
    pub secure_cookie: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            cookie_name: "jobdeck_session".to_string(),
            header_name: "x-session-id".to_string(),
            query_param: "session".to_string(),
            secure_cookie: false,
        }
    }
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// `[worker]` table: the external program that performs a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Program followed by its fixed leading arguments. The descriptor path
    /// is appended as the final argument.
    pub command: Vec<String>,
    /// Working directory for the worker. Defaults to the server's cwd.
    pub cwd: Option<PathBuf>,
    /// Fixed entry URL written into every job descriptor.
    pub entry_url: String,
    /// Directory for transient job descriptors. Defaults to the OS temp dir.
    pub descriptor_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL when a job is cancelled.
    pub kill_grace_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: vec!["node".to_string(), "src/runner.js".to_string()],
            cwd: None,
            entry_url: DEFAULT_ENTRY_URL.to_string(),
            descriptor_dir: None,
            kill_grace_secs: 5,
        }
    }
}

impl WorkerSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn descriptor_dir(&self) -> PathBuf {
        self.descriptor_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Settings {
    /// Load settings from a TOML file. Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let settings: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        settings.validate()?;
        Ok(Some(settings))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(ConfigError::Invalid("worker.command must name a program".into()));
        }
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::Invalid("session.ttl_secs must be positive".into()));
        }
        for (key, value) in [
            ("session.cookie_name", &self.session.cookie_name),
            ("session.header_name", &self.session.header_name),
            ("session.query_param", &self.session.query_param),
        ] {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(ConfigError::Invalid(format!("{key} must be a non-empty token")));
            }
        }
        Ok(())
    }
}

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
