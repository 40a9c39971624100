//! Link configuration.
//!
//! The peer is fixed: its address and the well-known service identifier come from
//! configuration, never from discovery. Configuration is read from a TOML file in which
//! every table and field is optional:
//!
//! ```toml
//! [peer]
//! address = "192.168.4.1:23"
//! service_id = "00001101-0000-1000-8000-00805f9b34fb"
//! connect_timeout_ms = 10000
//!
//! [link]
//! max_frame_len = 1024
//!
//! [reconnect]
//! max_attempts = 1
//! delay_ms = 250
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Serial port profile service class, the identifier serial-link robot modules advertise.
pub const SERIAL_PORT_SERVICE_ID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

const DEFAULT_ADDRESS: &str = "127.0.0.1:2323";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config, {reason}")]
    Invalid { reason: String },
}

/// Identity of the one peer the link talks to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    pub address: String,
    pub service_id: Uuid,
    pub connect_timeout_ms: u64,
}

impl PeerConfig {
    /// Transport-level bound on one connect. The connection manager itself has none.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            service_id: SERIAL_PORT_SERVICE_ID,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FramingConfig {
    /// Longest inbound frame accepted before the session fails. Unbounded when absent.
    pub max_frame_len: Option<usize>,
}

/// How a session lost to a write failure is re-established.
///
/// At most `max_attempts` automatic reconnects are made between two successful
/// connections, each after `delay_ms`. Failed connect attempts are never retried
/// automatically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub peer: PeerConfig,
    pub link: FramingConfig,
    pub reconnect: ReconnectPolicy,
}

impl LinkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!("loaded link configuration from {path:?}");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "peer address is empty".to_string(),
            });
        }
        if self.peer.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "connect_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.link.max_frame_len == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "max_frame_len must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
