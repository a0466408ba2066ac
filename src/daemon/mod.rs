//! # Daemon
//!
//! The [`Daemon`] owns every store and backend and drives container
//! lifecycles. There is no global state: callers construct one with
//! [`Daemon::new`] and share it as `Arc<Daemon>`.
//!
//! ## Bootstrap
//!
//! ```text
//! Daemon::new
//!   ├─ create <root>                         (0700)
//!   ├─ DriverRegistry::new_driver            <root>/<driver>
//!   ├─ Graph::new                            <root>/graph
//!   ├─ containers dir                        <root>/containers
//!   ├─ LinkGraph::open                       <root>/linkgraph.db
//!   └─ restore()
//!        ├─ load every container dir (skip unreadable / foreign driver)
//!        ├─ register containers named in the link graph, in path order
//!        ├─ name and register the rest
//!        └─ auto-restart by policy
//! ```
//!
//! ## Boot Reconciliation
//!
//! A container persisted as running belonged to a previous daemon. It is
//! terminated through the execution driver, unmounted and marked stopped.
//! If the driver no longer knows it, its exit code becomes
//! [`RECONCILED_EXIT_CODE`].
//!
//! ## Name Reservation
//!
//! The link graph is the only arbiter of name uniqueness. A name whose
//! holder is neither registered nor being created is stale: it is dropped
//! and the reservation retried once.

mod monitor;
mod network;
mod start;
mod stop;

use crate::archive::{Change, LayerArchive};
use crate::config::DaemonConfig;
use crate::constants::{
    CONTAINERS_DIR, GRAPH_DIR, INIT_LAYER_SUFFIX, KILL_WAIT_TIMEOUT, LINKGRAPH_FILE,
    NAME_GENERATION_ATTEMPTS, RECONCILED_EXIT_CODE, generate_id, truncate_id, validate_id,
};
use crate::container::{Container, NewContainer};
use crate::containers::ContainerStore;
use crate::error::{Error, Result};
use crate::execdriver::{Command, ExecDriver, ResourceStats};
use crate::graph::Graph;
use crate::graphdriver::{DriverRegistry, GraphDriver};
use crate::image::Image;
use crate::linkgraph::LinkGraph;
use crate::names::{random_name, validate_name};
use crate::network::NetworkBackend;
use crate::resolvconf;
use crate::runconfig::{HostConfig, RestartPolicyName, RunConfig, parse_link};
use crate::sysinfo::SysInfo;
use crate::truncindex::TruncIndex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Backends a daemon runs on.
pub struct DaemonBackends {
    pub exec_driver: Arc<dyn ExecDriver>,
    /// Without a network backend, container networking is disabled.
    pub network: Option<Arc<dyn NetworkBackend>>,
    pub drivers: DriverRegistry,
    pub sysinfo: SysInfo,
}

impl DaemonBackends {
    /// Built-in graph drivers, no network backend, detected host capabilities.
    pub fn new(exec_driver: Arc<dyn ExecDriver>) -> Self {
        Self {
            exec_driver,
            network: None,
            drivers: DriverRegistry::with_defaults(),
            sysinfo: SysInfo::detect(),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_sysinfo(mut self, sysinfo: SysInfo) -> Self {
        self.sysinfo = sysinfo;
        self
    }
}

/// Container engine.
pub struct Daemon {
    config: DaemonConfig,
    repository: PathBuf,
    containers: ContainerStore,
    id_index: TruncIndex,
    graph: Graph,
    driver: Arc<dyn GraphDriver>,
    exec_driver: Arc<dyn ExecDriver>,
    network: Option<Arc<dyn NetworkBackend>>,
    links: LinkGraph,
    sysinfo: SysInfo,
    /// IDs reserved by a `create` that has not registered yet.
    pending: Mutex<HashSet<String>>,
    this: Weak<Daemon>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("root", &self.config.root)
            .field("driver", &self.driver.name())
            .field("exec_driver", &self.exec_driver.name())
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}

/// Removes an ID from the pending set when creation ends either way.
struct PendingGuard<'a> {
    daemon: &'a Daemon,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.daemon
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl Daemon {
    /// Opens (or initializes) the daemon state under `config.root` and
    /// restores its containers.
    pub async fn new(mut config: DaemonConfig, backends: DaemonBackends) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        fs::set_permissions(&config.root, fs::Permissions::from_mode(0o700))?;

        let driver = backends
            .drivers
            .new_driver(&config.graph_driver, &config.root, &config.graph_options)?;
        let graph = Graph::new(&config.root.join(GRAPH_DIR), driver.clone())?;

        let repository = config.root.join(CONTAINERS_DIR);
        fs::create_dir_all(&repository)?;
        fs::set_permissions(&repository, fs::Permissions::from_mode(0o700))?;

        let links = LinkGraph::open(&config.root.join(LINKGRAPH_FILE))?;

        if backends.network.is_none() && !config.disable_network {
            info!("no network backend configured, container networking disabled");
            config.disable_network = true;
        }
        if backends.sysinfo.ipv4_forwarding_disabled {
            warn!("IPv4 forwarding is disabled, containers will not reach the network");
        }

        let daemon = Arc::new_cyclic(|this| Self {
            config,
            repository,
            containers: ContainerStore::new(),
            id_index: TruncIndex::new(),
            graph,
            driver,
            exec_driver: backends.exec_driver,
            network: backends.network,
            links,
            sysinfo: backends.sysinfo,
            pending: Mutex::new(HashSet::new()),
            this: this.clone(),
        });

        daemon.restore().await?;
        info!(
            "daemon ready: {} container(s), graph driver {}, exec driver {}",
            daemon.containers.len(),
            daemon.driver.name(),
            daemon.exec_driver.name()
        );
        Ok(daemon)
    }

    /// Owning handle, for tasks that outlive a borrowed call.
    fn handle(&self) -> Result<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| Error::Internal("daemon is shutting down".to_string()))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    pub fn exec_driver(&self) -> &Arc<dyn ExecDriver> {
        &self.exec_driver
    }

    pub fn links(&self) -> &LinkGraph {
        &self.links
    }

    pub fn sysinfo(&self) -> &SysInfo {
        &self.sysinfo
    }

    fn container_root(&self, id: &str) -> PathBuf {
        self.repository.join(id)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Looks a container up by full ID, exact name, or unique ID prefix.
    pub fn get(&self, prefix_or_name: &str) -> Result<Arc<Container>> {
        if let Some(container) = self.containers.get(prefix_or_name) {
            return Ok(container);
        }
        if let Some(container) = self.get_by_name(prefix_or_name)? {
            return Ok(container);
        }
        self.id_index
            .get(prefix_or_name)?
            .and_then(|id| self.containers.get(&id))
            .ok_or_else(|| Error::ContainerNotFound(prefix_or_name.to_string()))
    }

    /// Looks a container up by exact name, with or without the leading `/`.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Arc<Container>>> {
        if name.is_empty() {
            return Ok(None);
        }
        let full = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        };
        Ok(self
            .links
            .get(&full)?
            .and_then(|id| self.containers.get(&id)))
    }

    pub fn exists(&self, prefix_or_name: &str) -> bool {
        self.get(prefix_or_name).is_ok()
    }

    /// Every container, newest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        self.containers.list()
    }

    // =========================================================================
    // Restore & Register
    // =========================================================================

    fn load(&self, id: &str) -> Result<Container> {
        let root = self.container_root(id);
        let container = Container::load(&root)?;
        if container.id != id {
            return Err(Error::CorruptRecord {
                path: root,
                reason: format!("container {} is stored at {}", container.id, id),
            });
        }
        Ok(container)
    }

    fn driver_matches(&self, container: &Container) -> bool {
        let current = self.driver.name();
        container.driver == current || (container.driver.is_empty() && current == "vfs")
    }

    async fn restore(&self) -> Result<()> {
        let mut loaded: HashMap<String, Arc<Container>> = HashMap::new();
        for entry in fs::read_dir(&self.repository)? {
            let id = entry?.file_name().to_string_lossy().into_owned();
            match self.load(&id) {
                Ok(container) if self.driver_matches(&container) => {
                    debug!("loaded container {}", container.id);
                    loaded.insert(container.id.clone(), Arc::new(container));
                }
                Ok(container) => debug!(
                    "cannot load container {}: created with graph driver '{}'",
                    container.id, container.driver
                ),
                Err(e) => error!("failed to load container {}: {}", id, e),
            }
        }

        let mut registered = Vec::new();
        for (path, id) in self.links.paths()? {
            let Some(container) = loaded.remove(&id) else {
                continue;
            };
            debug!("registering {} found at {}", container.id, path);
            match self.register(container.clone()).await {
                Ok(()) => registered.push(container),
                Err(e) => warn!("failed to register container {}: {}", container.id, e),
            }
        }

        // Anything left predates the link graph entry; give it a name.
        for container in loaded.into_values() {
            match self.generate_new_name(&container.id) {
                Ok(name) => container.write().name = name,
                Err(e) => debug!("setting default name for {}: {}", container.id, e),
            }
            match self.register(container.clone()).await {
                Ok(()) => registered.push(container),
                Err(e) => warn!("failed to register container {}: {}", container.id, e),
            }
        }

        if self.config.auto_restart {
            for container in &registered {
                let policy = container.host_config().restart_policy;
                let wants_restart = match policy.name {
                    RestartPolicyName::Always => true,
                    RestartPolicyName::OnFailure => container.state.exit_code() != 0,
                    RestartPolicyName::No => false,
                };
                if wants_restart {
                    debug!("starting container {} by restart policy", container.id);
                    if let Err(e) = self.start(container).await {
                        warn!("failed to restart container {}: {}", container.id, e);
                    }
                }
            }
        }

        info!("restored {} container(s)", registered.len());
        Ok(())
    }

    /// Makes a container known to the daemon.
    ///
    /// A container persisted as running is reconciled: it belonged to a
    /// previous daemon and is stopped here.
    pub async fn register(&self, container: Arc<Container>) -> Result<()> {
        if self.containers.contains(&container.id) {
            return Err(Error::ContainerAlreadyExists(container.id.clone()));
        }
        validate_id(&container.id).map_err(|reason| Error::InvalidContainerId {
            id: container.id.clone(),
            reason: reason.to_string(),
        })?;
        self.ensure_name(&container)?;

        if container.config().open_stdin {
            container.streams.open_stdin_pipe();
        }

        self.containers.add(container.clone())?;
        if let Err(e) = self.id_index.add(&container.id) {
            self.containers.delete(&container.id);
            return Err(e);
        }

        if container.state.is_running() {
            self.reconcile(&container).await?;
        }
        Ok(())
    }

    async fn reconcile(&self, container: &Container) -> Result<()> {
        debug!("stopping container {} left running by a previous daemon", container.id);
        let pid = container.state.pid();
        container.state.set_stopped(0);

        if let Err(e) = self.exec_driver.terminate(&Command::for_id(&container.id)).await {
            debug!("terminate {} (pid {}): {}", container.id, pid, e);
        }
        if let Err(e) = self.driver.put(&container.id) {
            debug!("unmount {}: {}", container.id, e);
        }
        if let Err(e) = container.to_disk() {
            debug!("saving stopped state of {}: {}", container.id, e);
        }

        let running = match self.exec_driver.info(&container.id).await {
            Ok(running) => running,
            Err(e) => {
                debug!("driver info for {}: {}", container.id, e);
                false
            }
        };
        if !running {
            info!(
                "container {} was supposed to be running but is not, marking stopped",
                truncate_id(&container.id)
            );
            container.state.set_stopped(RECONCILED_EXIT_CODE);
            container.to_disk()?;
        }
        Ok(())
    }

    fn ensure_name(&self, container: &Container) -> Result<()> {
        if !container.name().is_empty() {
            return Ok(());
        }
        let name = self.generate_new_name(&container.id)?;
        container.write().name = name;
        container.to_disk()
    }

    // =========================================================================
    // Names & Links
    // =========================================================================

    fn is_live(&self, id: &str) -> bool {
        self.containers.contains(id)
            || self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(id)
    }

    /// Reserves `name` for container `id`, returning it with its leading `/`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] if the name does not match the name pattern
    /// - [`Error::NameConflict`] if a live container holds the name
    pub fn reserve_name(&self, id: &str, name: &str) -> Result<String> {
        let name = validate_name(name)?;
        for attempt in 0..2 {
            match self.links.set(&name, id) {
                Ok(()) => return Ok(name),
                Err(Error::NonUniqueName(_)) => {}
                Err(e) => return Err(e),
            }

            match self.links.get(&name)? {
                Some(holder) if attempt > 0 || self.is_live(&holder) => {
                    return Err(Error::NameConflict {
                        name: name.trim_start_matches('/').to_string(),
                        holder: truncate_id(&holder).to_string(),
                    });
                }
                Some(stale) => {
                    warn!("dropping stale name {} held by {}", name, truncate_id(&stale));
                    self.links.delete(&name)?;
                }
                None => {}
            }
        }
        Err(Error::LinkGraph(format!("could not reserve name {}", name)))
    }

    /// Reserves a random name for `id`, falling back to its short ID.
    pub fn generate_new_name(&self, id: &str) -> Result<String> {
        for attempt in 0..NAME_GENERATION_ATTEMPTS {
            let name = format!("/{}", random_name(attempt));
            match self.links.set(&name, id) {
                Ok(()) => return Ok(name),
                Err(Error::NonUniqueName(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let name = format!("/{}", truncate_id(id));
        self.links.set(&name, id)?;
        Ok(name)
    }

    /// Records the links of `host_config` for `container`.
    pub fn register_links(&self, container: &Container, host_config: &HostConfig) -> Result<()> {
        let parent = container.name();
        for link in &host_config.links {
            let (name, alias) = parse_link(link)?;
            let child = self
                .get(&name)
                .map_err(|_| Error::ContainerNotFound(format!("could not get container for {}", name)))?;
            if child.host_config().network_mode.is_host() {
                return Err(Error::InvalidConfig(
                    "conflicting options: host type networking can't be used with links".to_string(),
                ));
            }
            let full = format!("{}/{}", parent, alias);
            if !self.links.exists(&full)? {
                self.links.set(&full, &child.id)?;
                debug!("linked {} as {}", truncate_id(&child.id), full);
            }
        }
        Ok(())
    }

    /// Containers `name` links to, keyed by link path.
    pub fn children(&self, name: &str) -> Result<Vec<(String, Arc<Container>)>> {
        Ok(self
            .links
            .children(name)?
            .into_iter()
            .filter_map(|(path, id)| self.containers.get(&id).map(|c| (path, c)))
            .collect())
    }

    /// Names of the containers linking to `name`.
    pub fn parents(&self, name: &str) -> Result<Vec<String>> {
        self.links.parents(name)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container from `image`.
    ///
    /// `config` is merged with the image defaults. An empty `name` gets a
    /// generated one.
    pub async fn create(
        &self,
        mut config: RunConfig,
        host_config: HostConfig,
        image: &str,
        name: &str,
    ) -> Result<Arc<Container>> {
        let img = self.graph.get(image)?;
        if let Some(defaults) = &img.config {
            config.merge(defaults)?;
        }
        if config.entrypoint.is_empty() && config.cmd.is_empty() {
            return Err(Error::InvalidConfig("no command specified".to_string()));
        }
        if config.image.is_empty() {
            config.image = image.to_string();
        }
        if !config.network_disabled && self.sysinfo.ipv4_forwarding_disabled {
            warn!("IPv4 forwarding is disabled");
        }

        let id = generate_id();
        self.pending
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .insert(id.clone());
        let _pending = PendingGuard {
            daemon: self,
            id: id.clone(),
        };

        let name = if name.is_empty() {
            self.generate_new_name(&id)?
        } else {
            self.reserve_name(&id, name)?
        };
        if config.hostname.is_empty() {
            config.hostname = truncate_id(&id).to_string();
        }

        let (path, args) = config.entrypoint_and_args();
        let container = Arc::new(Container::new(
            NewContainer {
                id: id.clone(),
                name,
                path,
                args,
                config,
                host_config: HostConfig::default(),
                image_id: img.id.clone(),
                driver: self.driver.name().to_string(),
                exec_driver: self.exec_driver.name().to_string(),
            },
            self.container_root(&id),
        ));

        if let Err(e) = self.finish_create(&container, &img, host_config).await {
            self.discard(&container);
            return Err(e);
        }
        info!("created container {}", container);
        Ok(container)
    }

    async fn finish_create(
        &self,
        container: &Arc<Container>,
        img: &Image,
        host_config: HostConfig,
    ) -> Result<()> {
        self.create_rootfs(container, img)?;
        self.register(container.clone()).await?;
        self.register_links(container, &host_config)?;
        container.set_host_config(host_config);
        container.to_disk()
    }

    /// Undoes a failed create.
    fn discard(&self, container: &Container) {
        self.containers.delete(&container.id);
        if let Err(e) = self.id_index.delete(&container.id) {
            debug!("index cleanup for {}: {}", container.id, e);
        }
        if let Err(e) = self.links.purge(&container.id) {
            warn!("failed to drop names of {}: {}", container.id, e);
        }
        for layer in [container.id.clone(), format!("{}{}", container.id, INIT_LAYER_SUFFIX)] {
            if self.driver.exists(&layer)
                && let Err(e) = self.driver.remove(&layer)
            {
                warn!("failed to remove layer {}: {}", layer, e);
            }
        }
        if let Err(e) = fs::remove_dir_all(container.root())
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove {}: {}", container.root().display(), e);
        }
    }

    /// Creates the init layer on the image and the container layer on it.
    fn create_rootfs(&self, container: &Container, img: &Image) -> Result<()> {
        // Also the barrier against a second create of the same ID.
        fs::create_dir(container.root())?;
        fs::set_permissions(container.root(), fs::Permissions::from_mode(0o700))?;

        let init_id = format!("{}{}", container.id, INIT_LAYER_SUFFIX);
        self.driver.create(&init_id, &img.id)?;
        let init_path = self.driver.get(&init_id, "")?;
        let setup = setup_init_layer(&init_path);
        if let Err(e) = self.driver.put(&init_id) {
            warn!("failed to release init layer {}: {}", init_id, e);
        }
        setup?;

        self.driver.create(&container.id, &init_id)
    }

    // =========================================================================
    // Layer Access
    // =========================================================================

    /// Mounts the container's layer and records the mount path.
    pub fn mount(&self, container: &Container) -> Result<PathBuf> {
        let dir = self
            .driver
            .get(&container.id, &container.mount_label())
            .map_err(|e| Error::MountFailed {
                id: container.id.clone(),
                reason: format!("driver {}: {}", self.driver.name(), e),
            })?;

        let mut inner = container.write();
        match &inner.basefs {
            Some(existing) if *existing != dir => {
                let reason = format!(
                    "driver {} returned inconsistent paths ('{}' then '{}')",
                    self.driver.name(),
                    existing.display(),
                    dir.display()
                );
                drop(inner);
                if let Err(e) = self.driver.put(&container.id) {
                    warn!("failed to release {}: {}", container.id, e);
                }
                return Err(Error::MountFailed {
                    id: container.id.clone(),
                    reason,
                });
            }
            Some(_) => {}
            None => inner.basefs = Some(dir.clone()),
        }
        Ok(dir)
    }

    /// Releases one mount reference of the container's layer.
    pub fn unmount(&self, container: &Container) -> Result<()> {
        self.driver.put(&container.id)
    }

    fn with_mount<T>(&self, container: &Container, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.mount(container)?;
        let result = f();
        if let Err(e) = self.unmount(container) {
            warn!("failed to unmount {}: {}", container.id, e);
        }
        result
    }

    /// Filesystem changes of the container over its image.
    pub fn changes(&self, container: &Container) -> Result<Vec<Change>> {
        let init_id = format!("{}{}", container.id, INIT_LAYER_SUFFIX);
        self.with_mount(container, || self.driver.changes(&container.id, &init_id))
    }

    /// Archive of the container's changes over its image.
    pub fn diff(&self, container: &Container) -> Result<LayerArchive> {
        let init_id = format!("{}{}", container.id, INIT_LAYER_SUFFIX);
        self.with_mount(container, || {
            let mut archive = self.driver.diff(&container.id, &init_id)?;
            let mut data = Vec::new();
            archive.read_to_end(&mut data)?;
            Ok(Box::new(Cursor::new(data)) as LayerArchive)
        })
    }

    /// Creates an image from the container's changes.
    ///
    /// With `pause`, a running container is paused while its layer is read.
    pub async fn commit(
        &self,
        container: &Container,
        comment: &str,
        author: &str,
        config: Option<RunConfig>,
        pause: bool,
    ) -> Result<Image> {
        let paused_here = if pause && container.state.is_running() && !container.state.is_paused() {
            match self.pause(container).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("committing {} without pausing: {}", container.id, e);
                    false
                }
            }
        } else {
            false
        };

        let result = self.diff(container).and_then(|layer| {
            self.graph.create(
                Some(layer),
                &container.id,
                &container.image_id,
                comment,
                author,
                Some(&container.config()),
                config,
            )
        });

        if paused_here && let Err(e) = self.unpause(container).await {
            warn!("failed to unpause {} after commit: {}", container.id, e);
        }
        result
    }

    /// Resource usage of a running container.
    pub async fn stats(&self, container: &Container) -> Result<ResourceStats> {
        self.exec_driver.stats(&container.id).await
    }

    // =========================================================================
    // Host DNS Refresh
    // =========================================================================

    /// Pushes a new host resolv.conf into containers that use it unmodified.
    ///
    /// Stopped containers whose resolv.conf still matches the stored hash
    /// get the new content now; running ones regenerate it on next start.
    pub fn update_resolv_conf(&self, host_content: &[u8]) -> Result<()> {
        let (content, _) = resolvconf::filter(host_content, self.config.enable_ipv6);
        let hash = resolvconf::hash(&content);
        for container in self.containers.list() {
            if let Err(e) = container_update_resolv_conf(&container, &content, &hash) {
                warn!("failed to update resolv.conf of {}: {}", container.id, e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops every running container, then releases backends.
    ///
    /// Each container gets `SIGTERM` and is killed if it is still up after
    /// [`KILL_WAIT_TIMEOUT`].
    pub async fn shutdown(&self) -> Result<()> {
        debug!("starting clean shutdown of all containers");
        let daemon = self.handle()?;
        let mut tasks = JoinSet::new();
        for container in self.containers.list() {
            if !container.state.is_running() {
                continue;
            }
            let daemon = daemon.clone();
            tasks.spawn(async move {
                debug!("stopping {}", container.id);
                match daemon.stop(&container, KILL_WAIT_TIMEOUT).await {
                    Ok(()) => debug!("container stopped {}", container.id),
                    Err(e) => warn!("failed to stop {}: {}", container.id, e),
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("container shutdown task failed: {}", e);
            }
        }

        if let Some(network) = &self.network
            && let Err(e) = network.release_all().await
        {
            warn!("failed to release network: {}", e);
        }
        self.driver.cleanup()?;
        info!("daemon shut down");
        Ok(())
    }
}

/// Replaces a stopped container's resolv.conf if the user never edited it.
fn container_update_resolv_conf(container: &Container, content: &[u8], new_hash: &str) -> Result<()> {
    let Some(path) = container.resolv_conf_path() else {
        return Ok(());
    };
    if container.state.is_running() {
        container.write().update_dns = true;
        return Ok(());
    }

    let current = match fs::read(&path) {
        Ok(current) => current,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let hash_path = hash_path_for(&path);
    let stored = fs::read_to_string(&hash_path).unwrap_or_default();
    if stored != resolvconf::hash(&current) {
        return Ok(());
    }

    debug!("replacing {} with updated host resolv.conf", path.display());
    crate::fsutil::write_atomic(&hash_path, new_hash.as_bytes())?;
    crate::fsutil::write_atomic(&path, content)
}

/// `resolv.conf.hash` next to a resolv.conf.
fn hash_path_for(resolv_conf: &Path) -> PathBuf {
    let mut name = resolv_conf.as_os_str().to_owned();
    name.push(".hash");
    PathBuf::from(name)
}

/// Populates the layer between an image and a container.
///
/// Mount points and files the engine bind mounts over must exist in every
/// container, whatever the image ships.
fn setup_init_layer(root: &Path) -> Result<()> {
    const DIRS: &[&str] = &["dev/pts", "dev/shm", "proc", "sys", "etc"];
    const FILES: &[&str] = &["etc/resolv.conf", "etc/hosts", "etc/hostname", "dev/console"];

    for dir in DIRS {
        let path = root.join(dir);
        if fs::symlink_metadata(&path).is_err() {
            fs::create_dir_all(&path)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }
    for file in FILES {
        let path = root.join(file);
        if fs::symlink_metadata(&path).is_err() {
            fs::write(&path, b"")?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }
    let mtab = root.join("etc/mtab");
    if fs::symlink_metadata(&mtab).is_err() {
        std::os::unix::fs::symlink("/proc/mounts", &mtab)?;
    }
    Ok(())
}
