//! # Container Record
//!
//! A [`Container`] is the daemon's in-memory view of one container plus its
//! persisted form:
//!
//! ```text
//! <root>/containers/<id>/
//! ├── config.json        ContainerRecord (run config, state, network settings)
//! ├── hostconfig.json    HostConfig
//! ├── hostname
//! ├── hosts
//! ├── resolv.conf
//! ├── resolv.conf.hash   hash of the resolv.conf the engine last wrote
//! └── <id>-json.log      stdout/stderr log
//! ```
//!
//! Identity fields never change after creation. Everything the lifecycle
//! code updates lives behind one `RwLock` that is never held across an
//! `.await`; state transitions go through the container's [`StateHandle`].

use crate::constants::{CONFIG_FILE, HOSTCONFIG_FILE, validate_id};
use crate::error::{Error, Result};
use crate::execdriver::Command;
use crate::fsutil::write_atomic;
use crate::runconfig::{HostConfig, PortMap, RunConfig};
use crate::state::{State, StateHandle};
use crate::streams::StreamConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Network configuration assigned to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub ip_address: String,
    pub ip_prefix_len: u8,
    pub mac_address: String,
    pub gateway: String,
    pub bridge: String,
    /// Exposed ports and the host bindings allocated for them.
    pub ports: PortMap,
}

impl NetworkSettings {
    /// Returns true once an interface was allocated.
    pub fn is_allocated(&self) -> bool {
        !self.ip_address.is_empty()
    }
}

/// Persisted form of a container (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub created: DateTime<Utc>,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub state: State,
    /// Image the container was created from.
    pub image: String,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    #[serde(default)]
    pub resolv_conf_path: Option<PathBuf>,
    #[serde(default)]
    pub hostname_path: Option<PathBuf>,
    #[serde(default)]
    pub hosts_path: Option<PathBuf>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub exec_driver: String,
    #[serde(default)]
    pub mount_label: String,
    #[serde(default)]
    pub process_label: String,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub update_dns: bool,
}

/// Fields the lifecycle code updates.
#[derive(Debug, Clone, Default)]
pub struct Mutable {
    pub name: String,
    pub config: RunConfig,
    pub host_config: HostConfig,
    pub network_settings: NetworkSettings,
    pub resolv_conf_path: Option<PathBuf>,
    pub hostname_path: Option<PathBuf>,
    pub hosts_path: Option<PathBuf>,
    /// Regenerate resolv.conf from the host on next start.
    pub update_dns: bool,
    pub restart_count: u32,
    /// Root filesystem path of the last mount. Kept after unmount so a
    /// later mount can check the driver returns the same path.
    pub basefs: Option<PathBuf>,
    pub mount_label: String,
    pub process_label: String,
}

/// A container known to the daemon.
#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub created: DateTime<Utc>,
    /// Process path and arguments resolved at creation.
    pub path: String,
    pub args: Vec<String>,
    pub image_id: String,
    /// Graph driver holding the container's layer.
    pub driver: String,
    pub exec_driver: String,
    root: PathBuf,

    pub state: StateHandle,
    inner: RwLock<Mutable>,
    /// Serializes start, stop and restart.
    pub(crate) op_lock: tokio::sync::Mutex<()>,
    pub streams: StreamConfig,
    command: Mutex<Option<Command>>,
    /// Set by a user stop or kill; the monitor then does not restart.
    user_stopped: AtomicBool,
    stop_requested: Notify,
}

/// Identity of a new container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub config: RunConfig,
    pub host_config: HostConfig,
    pub image_id: String,
    pub driver: String,
    pub exec_driver: String,
}

impl Container {
    /// Creates a container that has never run, rooted at `root`.
    pub fn new(spec: NewContainer, root: PathBuf) -> Self {
        Self::assemble(
            ContainerRecord {
                id: spec.id,
                created: Utc::now(),
                path: spec.path,
                args: spec.args,
                config: spec.config,
                state: State::default(),
                image: spec.image_id,
                network_settings: NetworkSettings::default(),
                resolv_conf_path: None,
                hostname_path: None,
                hosts_path: None,
                name: spec.name,
                driver: spec.driver,
                exec_driver: spec.exec_driver,
                mount_label: String::new(),
                process_label: String::new(),
                restart_count: 0,
                update_dns: false,
            },
            spec.host_config,
            root,
        )
    }

    fn assemble(record: ContainerRecord, host_config: HostConfig, root: PathBuf) -> Self {
        Self {
            id: record.id,
            created: record.created,
            path: record.path,
            args: record.args,
            image_id: record.image,
            driver: record.driver,
            exec_driver: record.exec_driver,
            root,
            state: StateHandle::new(record.state),
            inner: RwLock::new(Mutable {
                name: record.name,
                config: record.config,
                host_config,
                network_settings: record.network_settings,
                resolv_conf_path: record.resolv_conf_path,
                hostname_path: record.hostname_path,
                hosts_path: record.hosts_path,
                update_dns: record.update_dns,
                restart_count: record.restart_count,
                basefs: None,
                mount_label: record.mount_label,
                process_label: record.process_label,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            streams: StreamConfig::new(),
            command: Mutex::new(None),
            user_stopped: AtomicBool::new(false),
            stop_requested: Notify::new(),
        }
    }

    /// Loads a container from its directory.
    ///
    /// A missing `hostconfig.json` yields the default host configuration.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let data = fs::read(&config_path)?;
        let record: ContainerRecord =
            serde_json::from_slice(&data).map_err(|e| Error::CorruptRecord {
                path: config_path.clone(),
                reason: e.to_string(),
            })?;
        validate_id(&record.id).map_err(|reason| Error::InvalidContainerId {
            id: record.id.clone(),
            reason: reason.to_string(),
        })?;

        let host_config_path = root.join(HOSTCONFIG_FILE);
        let host_config = match fs::read(&host_config_path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| Error::CorruptRecord {
                path: host_config_path,
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HostConfig::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self::assemble(record, host_config, root.to_path_buf()))
    }

    /// Snapshot of the persisted form.
    pub fn record(&self) -> ContainerRecord {
        let inner = self.read();
        ContainerRecord {
            id: self.id.clone(),
            created: self.created,
            path: self.path.clone(),
            args: self.args.clone(),
            config: inner.config.clone(),
            state: self.state.snapshot(),
            image: self.image_id.clone(),
            network_settings: inner.network_settings.clone(),
            resolv_conf_path: inner.resolv_conf_path.clone(),
            hostname_path: inner.hostname_path.clone(),
            hosts_path: inner.hosts_path.clone(),
            name: inner.name.clone(),
            driver: self.driver.clone(),
            exec_driver: self.exec_driver.clone(),
            mount_label: inner.mount_label.clone(),
            process_label: inner.process_label.clone(),
            restart_count: inner.restart_count,
            update_dns: inner.update_dns,
        }
    }

    /// Writes `config.json` and `hostconfig.json`.
    pub fn to_disk(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let data = serde_json::to_vec(&self.record())?;
        write_atomic(&self.root.join(CONFIG_FILE), &data)?;
        self.write_host_config()
    }

    /// Writes `hostconfig.json` only.
    pub fn write_host_config(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.read().host_config)?;
        write_atomic(&self.root.join(HOSTCONFIG_FILE), &data)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Mutable> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Mutable> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Container directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a per-container file such as `hosts`.
    pub fn resource_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("{}-json.log", self.id))
    }

    /// Name with its leading `/`.
    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn config(&self) -> RunConfig {
        self.read().config.clone()
    }

    pub fn host_config(&self) -> HostConfig {
        self.read().host_config.clone()
    }

    /// Replaces the host configuration, effective from the next start.
    pub fn set_host_config(&self, host_config: HostConfig) {
        self.write().host_config = host_config;
    }

    pub fn network_settings(&self) -> NetworkSettings {
        self.read().network_settings.clone()
    }

    pub fn resolv_conf_path(&self) -> Option<PathBuf> {
        self.read().resolv_conf_path.clone()
    }

    pub fn hosts_path(&self) -> Option<PathBuf> {
        self.read().hosts_path.clone()
    }

    pub fn hostname_path(&self) -> Option<PathBuf> {
        self.read().hostname_path.clone()
    }

    pub fn update_dns(&self) -> bool {
        self.read().update_dns
    }

    pub fn restart_count(&self) -> u32 {
        self.read().restart_count
    }

    /// Root filesystem path of the last mount, if ever mounted.
    pub fn basefs(&self) -> Option<PathBuf> {
        self.read().basefs.clone()
    }

    pub fn mount_label(&self) -> String {
        self.read().mount_label.clone()
    }

    /// Returns true if networking is neither disabled nor shared.
    pub fn has_private_network(&self) -> bool {
        let inner = self.read();
        !inner.config.network_disabled && inner.host_config.network_mode.is_private()
    }

    // =========================================================================
    // Process Bookkeeping
    // =========================================================================

    /// Command of the current or last run, or one carrying only the ID.
    pub fn command(&self) -> Command {
        self.command
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| Command::for_id(&self.id))
    }

    pub(crate) fn set_command(&self, command: Command) {
        *self.command.lock().unwrap_or_else(|e| e.into_inner()) = Some(command);
    }

    /// Tells the monitor not to restart after the current process exits.
    pub(crate) fn exit_on_next(&self) {
        self.user_stopped.store(true, Ordering::SeqCst);
        self.stop_requested.notify_waiters();
    }

    pub(crate) fn user_stopped(&self) -> bool {
        self.user_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_monitor(&self) {
        self.user_stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop is requested after this call.
    pub(crate) fn stop_requested(&self) -> Notified<'_> {
        self.stop_requested.notified()
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", crate::constants::truncate_id(&self.id), self.name())
    }
}
