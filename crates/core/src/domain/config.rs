//! Server configuration
//!
//! The relay reads an optional TOML file:
//!
//! ```toml
//! bind = "0.0.0.0:8765"
//!
//! [tls]
//! cert_path = "cert.pem"
//! key_path = "key.pem"
//!
//! [audio]
//! sink_queue_buffers = 8
//! ```
//!
//! Every key is optional. Relative TLS paths are resolved against the
//! directory holding the file. Command-line flags take precedence over the
//! file; that layering happens in the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub const DEFAULT_PORT: u16 = 8765;
pub const APP_DIR_NAME: &str = "audiorelay";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Certificate and private key used to terminate TLS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
        }
    }
}

/// Playback settings shared by every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Depth of each sink's queue, in buffers of `framesPerBuffer` frames
    pub sink_queue_buffers: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sink_queue_buffers: 8,
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind: SocketAddr,
    pub tls: TlsConfig,
    pub audio: AudioSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tls: TlsConfig::default(),
            audio: AudioSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    ///
    /// Relative TLS paths in the file are resolved against its directory.
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let mut config: Self = toml::from_str(&contents)?;

        if let Some(parent) = path.parent() {
            config.resolve_paths(parent);
        }

        debug!(bind = %config.bind, "Configuration loaded successfully");
        Ok(config)
    }

    /// Load `explicit` if given, else the default file if it exists, else defaults
    ///
    /// An explicitly named file must exist. A default file that exists but
    /// cannot be parsed is an error too; the server never starts on a
    /// configuration it could not read.
    #[instrument(skip(explicit))]
    pub async fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path).await;
        }

        match default_config_path() {
            Ok(path) if fs::try_exists(&path).await.unwrap_or(false) => {
                Self::load_from_file(&path).await
            }
            Ok(path) => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => {
                debug!(error = %e, "No configuration directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Make relative TLS paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.tls.cert_path, &mut self.tls.key_path] {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sink_queue_buffers == 0 {
            return Err(ConfigError::Invalid(
                "audio.sink_queue_buffers must be at least 1".to_string(),
            ));
        }
        if self.tls.cert_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "tls.cert_path must not be empty".to_string(),
            ));
        }
        if self.tls.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "tls.key_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `~/.config/audiorelay/config.toml` on Linux, the platform equivalent elsewhere
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
}
