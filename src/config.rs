//! Daemon configuration.
//!
//! [`DaemonConfig`] is plain data. Every field has a default, so a config
//! file only needs to name what it overrides:
//!
//! ```json
//! {
//!   "root": "/var/lib/magikd",
//!   "graph_driver": "layered",
//!   "dns": ["10.0.0.2"],
//!   "auto_restart": true
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::{HOST_HOSTS, HOST_RESOLV_CONF};

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of all persisted state.
    pub root: PathBuf,
    /// Graph driver name. Empty selects one automatically.
    pub graph_driver: String,
    /// Backend specific options, `key=value`.
    pub graph_options: Vec<String>,
    /// DNS servers applied to containers that set none.
    pub dns: Vec<String>,
    /// DNS search domains applied to containers that set none.
    pub dns_search: Vec<String>,
    /// Never allocate container networking.
    pub disable_network: bool,
    /// Keep IPv6 nameservers when filtering the host resolv.conf.
    pub enable_ipv6: bool,
    /// Start restart-policy eligible containers on boot.
    pub auto_restart: bool,
    /// MTU handed to the execution driver.
    pub mtu: u32,
    /// Host DNS configuration copied into containers.
    pub host_resolv_conf: PathBuf,
    /// Host hosts file copied into host-networked containers.
    pub host_hosts: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            graph_driver: String::new(),
            graph_options: Vec::new(),
            dns: Vec::new(),
            dns_search: Vec::new(),
            disable_network: false,
            enable_ipv6: false,
            auto_restart: true,
            mtu: 1500,
            host_resolv_conf: PathBuf::from(HOST_RESOLV_CONF),
            host_hosts: PathBuf::from(HOST_HOSTS),
        }
    }
}

impl DaemonConfig {
    /// Creates a default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Returns the default root directory.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".magikd"))
            .unwrap_or_else(|| PathBuf::from(".magikd"))
    }

    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        debug!("loaded daemon config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("root must not be empty".to_string()));
        }
        if let Some(bad) = self.graph_options.iter().find(|o| !o.contains('=')) {
            return Err(Error::InvalidConfig(format!(
                "graph option '{}' is not key=value",
                bad
            )));
        }
        Ok(())
    }
}
