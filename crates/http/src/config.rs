//! Transfer configuration.
//!
//! Stored as JSON under the user's config directory:
//! `~/.config/courier/transfer.json` on Linux, `%APPDATA%\courier\transfer.json`
//! on Windows. Missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors from loading or saving the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no configuration directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest probed size (bytes on the wire) downloaded without asking.
    pub auto_accept_file_size: u64,

    /// Per-read timeout for HTTP responses, in seconds.
    pub read_timeout_secs: u64,

    /// Encrypt every upload, not only those of end-to-end encrypted messages.
    pub always_encrypt_uploads: bool,

    /// Route all transfers through `proxy_url`. Onion hosts always are.
    pub use_tor: bool,

    pub proxy_url: String,

    /// Concurrent pipeline phases.
    pub max_workers: usize,

    /// Ceiling for a download whose size the server never stated.
    pub max_unknown_download_size: u64,

    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            auto_accept_file_size: 524_288,
            read_timeout_secs: 30,
            always_encrypt_uploads: false,
            use_tor: false,
            proxy_url: "socks5h://127.0.0.1:9050".into(),
            max_workers: 4,
            max_unknown_download_size: 100 * 1024 * 1024,
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    /// Loads from the default location, falling back to defaults when the
    /// file is absent.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path()?)
    }

    /// Loads from `path`. A missing file yields defaults; a malformed one is
    /// logged and also yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<TransferConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path()?)
    }

    /// Writes the configuration as pretty JSON, readable only by the owner.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        set_permissions_0600(path);
        debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// `<config dir>/courier/transfer.json`.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_base_dir()?.join("courier").join("transfer.json"))
}

fn config_base_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(xdg));
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".config"))
            .ok_or(ConfigError::NoConfigDir)
    }
}
