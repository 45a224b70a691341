//! Runtime configuration.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults ([`NetConfig::default`])
//! 2. an optional TOML file
//! 3. `FRAMEWIRE_*` environment variables (`__` separates nested keys,
//!    e.g. `FRAMEWIRE_PASSWORDS__OPEN_DB=true`)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionOptions;
use crate::error::{FramewireError, Result};
use crate::protocol::wire_format::MAX_ORDINARY_LENGTH;
use crate::protocol::PasswordFlags;
use crate::writer::WriterConfig;

/// Default port of a dedicated server.
pub const SERVER_PORT: u16 = 5924;
/// Default port of a peer-to-peer node.
pub const PEER_PORT: u16 = 5925;

const ENV_PREFIX: &str = "FRAMEWIRE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Listen address.
    pub host: String,
    /// Listen port; `None` picks the default for the mode.
    pub port: Option<u16>,
    pub peer_mode: bool,
    /// Fragmentation threshold. Both peers must agree on it.
    pub max_datasize: usize,
    pub max_clients: u16,
    pub notification_timeout_secs: u64,
    pub housekeeping_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub channel_capacity: usize,
    pub max_pending_frames: usize,
    pub backpressure_timeout_ms: u64,
    pub passwords: PasswordFlags,
    /// User name → password.
    pub users: BTreeMap<String, String>,
    /// Initial system configuration entries.
    pub system: BTreeMap<String, String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            peer_mode: false,
            max_datasize: 512,
            max_clients: 64,
            notification_timeout_secs: 30,
            housekeeping_interval_secs: 60,
            idle_timeout_secs: 300,
            connect_timeout_secs: 10,
            channel_capacity: 1024,
            max_pending_frames: 1024,
            backpressure_timeout_ms: 5000,
            passwords: PasswordFlags::default(),
            users: BTreeMap::new(),
            system: BTreeMap::new(),
        }
    }
}

impl NetConfig {
    /// Defaults, then `path` (if given), then the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(NetConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: NetConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_datasize == 0 || self.max_datasize > MAX_ORDINARY_LENGTH {
            return Err(FramewireError::Config(format!(
                "max_datasize must be in 1..={}, got {}",
                MAX_ORDINARY_LENGTH, self.max_datasize
            )));
        }
        if self.max_clients == 0 {
            return Err(FramewireError::Config("max_clients must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(FramewireError::Config("channel_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Effective listen port.
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.peer_mode { PEER_PORT } else { SERVER_PORT })
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_datasize: self.max_datasize,
            writer: self.writer_config(),
        }
    }
}
