use serde::{Deserialize, Serialize};
use snapwall_common::Lifetime;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server settings. Every key is optional in the config file; missing keys
/// fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub upload_dir: PathBuf,
    pub data_file: PathBuf,
    pub static_dir: PathBuf,
    /// Request body cap in bytes.
    pub max_content_length: usize,
    pub allowed_extensions: Vec<String>,
    pub max_images: usize,
    /// Seconds.
    pub display_time: u64,
    /// Seconds.
    pub fadeout_time: u64,
    /// Seconds between reaper sweeps.
    pub sweep_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            upload_dir: PathBuf::from("uploads"),
            data_file: PathBuf::from("data.json"),
            static_dir: PathBuf::from("static"),
            max_content_length: 5 * 1024 * 1024,
            allowed_extensions: ["png", "jpg", "jpeg", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_images: 10,
            display_time: 5,
            fadeout_time: 10,
            sweep_interval: 2,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks limits and normalizes extensions to lowercase without a dot.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.max_images == 0 {
            return Err(ConfigError::Invalid("max_images must be at least 1".into()));
        }
        if self.sweep_interval == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval must be at least 1 second".into(),
            ));
        }
        if self.max_content_length == 0 {
            return Err(ConfigError::Invalid(
                "max_content_length must be positive".into(),
            ));
        }

        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed_extensions must not be empty".into(),
            ));
        }

        Ok(self)
    }

    pub fn lifetime(&self) -> Lifetime {
        Lifetime::from_secs(self.display_time, self.fadeout_time)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}
