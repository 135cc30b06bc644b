//! Network settings
//!
//! Values consumed by the connector, acceptor and channels. Loaded from a
//! JSON file or taken from `Default`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings loading errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Message magic identifying the network
    pub identifier: u32,
    /// Protocol level announced in `version`
    pub protocol_version: u32,
    pub user_agent: String,
    /// Local address the acceptor binds
    pub bind_address: IpAddr,
    /// Port the acceptor listens on
    pub inbound_port: u16,
    /// Pending connection queue for the listening socket
    pub listen_backlog: u32,
    /// Deadline for a single outbound TCP connect
    pub connect_timeout_milliseconds: u64,
    /// Keep-alive ping period
    pub heartbeat_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identifier: 0xd9b4_bef9,
            protocol_version: 70_012,
            user_agent: format!("/mini-network:{}/", env!("CARGO_PKG_VERSION")),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inbound_port: 8333,
            listen_backlog: 100,
            connect_timeout_milliseconds: 5_000,
            heartbeat_interval_seconds: 5 * 60,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let data = fs::read_to_string(path.as_ref())?;
        let settings = serde_json::from_str(&data)?;
        log::debug!("Loaded network settings from {}", path.as_ref().display());
        Ok(settings)
    }

    /// Write settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_milliseconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}
