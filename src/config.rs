//! Warden configuration.

use crate::{Result, WardenError};
use std::path::PathBuf;
use std::time::Duration;

/// Default distribution server for runtime releases.
pub const DEFAULT_DISTRIBUTION_URL: &str =
    "https://storage.googleapis.com/claude-code-dist-86c565f3-f756-42ad-8dfa-d59b1c096819/claude-code-releases";

/// Install script whose body names the latest released version.
pub const DEFAULT_INSTALL_SCRIPT_URL: &str = "https://claude.ai/install.sh";

/// Runtime config shared by the version and session services.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root for the registry database, downloaded versions and session dirs
    pub data_dir: PathBuf,
    pub distribution_base_url: String,
    pub install_script_url: String,
    /// Binary shipped with the host application; never deleted
    pub bundled_binary_path: PathBuf,
    pub discovery_ttl: Duration,
    /// Patches probed on the latest minor line, counting the latest itself
    pub latest_minor_window: u32,
    /// Patches probed on the previous minor line, counting down to zero
    pub previous_minor_window: u32,
    /// Used only to seed probing when the install script is unreachable
    pub baseline_version: String,
    pub default_model: String,
    pub title_model: String,
    pub http_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warden");
        Self {
            bundled_binary_path: data_dir.join("bundled").join(crate::platform::binary_name()),
            data_dir,
            distribution_base_url: DEFAULT_DISTRIBUTION_URL.to_string(),
            install_script_url: DEFAULT_INSTALL_SCRIPT_URL.to_string(),
            discovery_ttl: Duration::from_secs(5 * 60),
            latest_minor_window: 16,
            previous_minor_window: 21,
            baseline_version: "2.0.0".to_string(),
            default_model: "sonnet".to_string(),
            title_model: "haiku".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `WARDEN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("WARDEN_DATA_DIR") {
            config = config.with_data_dir(PathBuf::from(dir));
        }
        if let Ok(url) = std::env::var("WARDEN_DISTRIBUTION_URL") {
            config.distribution_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("WARDEN_INSTALL_SCRIPT_URL") {
            config.install_script_url = url;
        }
        if let Ok(path) = std::env::var("WARDEN_BUNDLED_BINARY") {
            config.bundled_binary_path = PathBuf::from(path);
        }
        if let Ok(model) = std::env::var("WARDEN_MODEL") {
            config.default_model = model;
        }
        if let Ok(secs) = std::env::var("WARDEN_DISCOVERY_TTL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| WardenError::Config(format!("WARDEN_DISCOVERY_TTL_SECS: {}", e)))?;
            config.discovery_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Move the data root, keeping the bundled binary under it unless it was
    /// pointed elsewhere explicitly.
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        let binary = crate::platform::binary_name();
        if self.bundled_binary_path == self.data_dir.join("bundled").join(binary) {
            self.bundled_binary_path = data_dir.join("bundled").join(binary);
        }
        self.data_dir = data_dir;
        self
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("versions.db")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.data_dir.join("versions")
    }

    /// Isolated config/working directory for one background purpose.
    pub fn session_dir(&self, purpose: &str) -> PathBuf {
        self.data_dir.join("sessions").join(purpose)
    }
}
