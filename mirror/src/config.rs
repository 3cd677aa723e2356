use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::remote::connection::{DEFAULT_HOST, DEFAULT_PORT, RemoteSettings};
use crate::remote::frame::AppIdentity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Top-level configuration, loaded from voice-mirror.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MirrorConfig {
    pub remote: RemoteSection,
    pub app: AppSection,
    pub credentials: CredentialsSection,
    pub log: LogSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub host: String,
    pub port: u16,
    pub handshake_timeout_secs: u64,
    /// Seconds to wait before reconnecting after the companion app goes away.
    /// `0` exits instead.
    pub reconnect_delay_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            handshake_timeout_secs: 10,
            reconnect_delay_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Distinguishes several instances paired with the same companion app.
    pub custom_id: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            identifier: "voice-mirror".into(),
            name: "Voice Mirror".into(),
            description: "Mirrors servers, channels and clients of the running voice client".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            custom_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub token_file: PathBuf,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("voice-mirror.token"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl MirrorConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(path, &contents)?
        } else {
            info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("VOICE_MIRROR_HOST") {
            self.remote.host = v;
        }
        if let Ok(v) = std::env::var("VOICE_MIRROR_PORT") {
            self.remote.port = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: "VOICE_MIRROR_PORT",
                value: v.clone(),
            })?;
        }
        if let Ok(v) = std::env::var("VOICE_MIRROR_TOKEN_FILE") {
            self.credentials.token_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VOICE_MIRROR_CUSTOM_ID")
            && !v.trim().is_empty()
        {
            self.app.custom_id = Some(v.trim().to_string());
        }
        if let Ok(v) = std::env::var("VOICE_MIRROR_LOG") {
            self.log.filter = v;
        }
        Ok(())
    }

    /// The identity sent in the auth frame, with the custom id applied.
    pub fn identity(&self) -> AppIdentity {
        let mut identity = AppIdentity {
            identifier: self.app.identifier.clone(),
            name: self.app.name.clone(),
            description: self.app.description.clone(),
            version: self.app.version.clone(),
        };
        if let Some(suffix) = self.app.custom_id.as_deref().filter(|s| !s.is_empty()) {
            identity.identifier.push_str(suffix);
            identity.name = format!("{} ({suffix})", identity.name);
        }
        identity
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            host: self.remote.host.clone(),
            port: self.remote.port,
            handshake_timeout: Duration::from_secs(self.remote.handshake_timeout_secs),
        }
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.remote.reconnect_delay_secs > 0)
            .then(|| Duration::from_secs(self.remote.reconnect_delay_secs))
    }
}
