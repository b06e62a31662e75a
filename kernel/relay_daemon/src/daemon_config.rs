use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_RELAY_BIN: &str = "relay_bot";
const DEFAULT_PUBLIC_CONFIG: &str = "relay_public.toml";
const DEFAULT_PRIVATE_CONFIG: &str = "relay_private.toml";
const DEFAULT_PUBLIC_TO_PRIVATE_PIPE: &str = "message_public_to_private.pipe";
const DEFAULT_PRIVATE_TO_PUBLIC_PIPE: &str = "message_private_to_public.pipe";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_GRACE_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum DaemonConfigError {
    #[error("read config {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub relay_bin: PathBuf,
    pub public_config: PathBuf,
    pub private_config: PathBuf,
    pub public_to_private_pipe: PathBuf,
    pub private_to_public_pipe: PathBuf,
    pub poll_interval_secs: u64,
    pub grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            relay_bin: PathBuf::from(DEFAULT_RELAY_BIN),
            public_config: PathBuf::from(DEFAULT_PUBLIC_CONFIG),
            private_config: PathBuf::from(DEFAULT_PRIVATE_CONFIG),
            public_to_private_pipe: PathBuf::from(DEFAULT_PUBLIC_TO_PRIVATE_PIPE),
            private_to_public_pipe: PathBuf::from(DEFAULT_PRIVATE_TO_PUBLIC_PIPE),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            grace_secs: DEFAULT_GRACE_SECS,
        }
    }
}

impl DaemonConfig {
    /// No path means all defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| DaemonConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DaemonConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        if config.poll_interval_secs == 0 {
            return Err(DaemonConfigError::Invalid(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if config.public_to_private_pipe == config.private_to_public_pipe {
            return Err(DaemonConfigError::Invalid(
                "the two pipes must be different paths".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// A bare program name is looked up next to the daemon binary first, then on PATH.
    pub fn resolve_relay_bin(&self) -> PathBuf {
        if self.relay_bin.components().count() != 1 {
            return self.relay_bin.clone();
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&self.relay_bin)));
        match sibling {
            Some(path) if path.is_file() => path,
            _ => self.relay_bin.clone(),
        }
    }
}
