//! Container start.
//!
//! ```text
//! start
//!   ├─ setup_container_dns        resolv.conf (+ .hash)
//!   ├─ mount                      rootfs via the graph driver
//!   ├─ initialize_networking      hostname, hosts, interface, ports
//!   ├─ update_parents_hosts       parents resolve this container's alias
//!   ├─ verify_daemon_settings     drop limits the host cannot enforce
//!   ├─ setup_linked_containers    link environment
//!   ├─ setup_working_directory
//!   ├─ populate_command
//!   └─ wait_for_start             monitor spawned, first process running
//! ```
//!
//! Any failure records the error on the container state, persists it and
//! releases whatever was set up.

use super::{Daemon, container_update_resolv_conf, monitor};
use crate::constants::{DEFAULT_PATH_ENV, START_FAILURE_EXIT_CODE};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::execdriver::{Command, Mount, Network, NetworkInterface, Resources};
use crate::fsutil::{resolve_in_root, write_atomic};
use crate::links::{Link, replace_or_append};
use crate::{etchosts, resolvconf};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

impl Daemon {
    /// Starts a container. Starting a running container does nothing.
    pub async fn start(&self, container: &Arc<Container>) -> Result<()> {
        let _op = container.op_lock.lock().await;
        self.start_locked(container).await
    }

    /// Start with the container's operation lock already held.
    pub(super) async fn start_locked(&self, container: &Arc<Container>) -> Result<()> {
        if container.state.is_running() {
            return Ok(());
        }

        match self.start_inner(container).await {
            Ok(()) => {
                info!("started container {}", container);
                Ok(())
            }
            Err(e) => {
                error!("failed to start container {}: {}", container.id, e);
                container.state.set_error(&e.to_string(), START_FAILURE_EXIT_CODE);
                if let Err(err) = container.to_disk() {
                    warn!("failed to persist {}: {}", container.id, err);
                }
                self.cleanup(container).await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, container: &Arc<Container>) -> Result<()> {
        self.setup_container_dns(container)?;
        let rootfs = self.mount(container)?;
        if let Err(e) = container.streams.set_log(&container.log_path()) {
            warn!("cannot open log for {}: {}", container.id, e);
        }
        self.initialize_networking(container).await?;
        self.update_parents_hosts(container)?;
        self.verify_daemon_settings(container);
        let linked_env = self.setup_linked_containers(container)?;
        setup_working_directory(container, &rootfs)?;
        let env = create_daemon_environment(container, linked_env);
        let command = self.populate_command(container, &rootfs, env)?;
        container.set_command(command);
        self.wait_for_start(container).await
    }

    // =========================================================================
    // DNS
    // =========================================================================

    fn setup_container_dns(&self, container: &Container) -> Result<()> {
        if let Some(path) = container.resolv_conf_path() {
            if container.update_dns() {
                debug!("refreshing resolv.conf of {} from the host", container.id);
                let latest = resolvconf::get(&self.config.host_resolv_conf)?;
                let (updated, _) = resolvconf::filter(&latest, self.config.enable_ipv6);
                let hash = resolvconf::hash(&updated);
                container_update_resolv_conf(container, &updated, &hash)?;
                container.write().update_dns = false;
            }
            debug!("reusing {}", path.display());
            return Ok(());
        }

        let host_config = container.host_config();
        let mut content = resolvconf::get(&self.config.host_resolv_conf)?;
        let path = container.resource_path("resolv.conf");
        container.write().resolv_conf_path = Some(path.clone());

        if !host_config.network_mode.is_host() {
            let has_overrides = !host_config.dns.is_empty()
                || !self.config.dns.is_empty()
                || !host_config.dns_search.is_empty()
                || !self.config.dns_search.is_empty();
            if has_overrides {
                let dns = first_non_empty(&host_config.dns, &self.config.dns)
                    .unwrap_or_else(|| resolvconf::nameservers(&content));
                let search = first_non_empty(&host_config.dns_search, &self.config.dns_search)
                    .unwrap_or_else(|| resolvconf::search_domains(&content));
                return write_atomic(&path, &resolvconf::build(&dns, &search));
            }
            content = resolvconf::filter(&content, self.config.enable_ipv6).0;
        }

        let mut hash_path = path.as_os_str().to_owned();
        hash_path.push(".hash");
        write_atomic(Path::new(&hash_path), resolvconf::hash(&content).as_bytes())?;
        write_atomic(&path, &content)
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Points the alias of this container in each parent's hosts file at
    /// its current address.
    fn update_parents_hosts(&self, container: &Container) -> Result<()> {
        if self.config.disable_network || !container.host_config().network_mode.is_private() {
            return Ok(());
        }
        let ip = container.network_settings().ip_address;
        for path in self.links.ref_paths(&container.id)? {
            let Some((parent_name, alias)) = path.rsplit_once('/') else {
                continue;
            };
            if parent_name.is_empty() {
                continue;
            }
            let parent = match self.get_by_name(parent_name) {
                Ok(Some(parent)) => parent,
                Ok(None) => continue,
                Err(e) => {
                    error!("looking up {}: {}", parent_name, e);
                    continue;
                }
            };
            let Some(hosts) = parent.hosts_path() else {
                continue;
            };
            debug!("update hosts of {} for alias {} with ip {}", parent.id, alias, ip);
            if let Err(e) = etchosts::update(&hosts, &ip, alias) {
                error!(
                    "failed to update hosts in parent container {} for alias {}: {}",
                    parent.id, alias, e
                );
            }
        }
        Ok(())
    }

    fn setup_linked_containers(&self, container: &Container) -> Result<Vec<String>> {
        let mut env = Vec::new();
        for (path, child) in self.children(&container.name())? {
            if !child.state.is_running() {
                return Err(Error::StartFailed {
                    id: container.id.clone(),
                    reason: format!(
                        "cannot link to a non running container: {} AS {}",
                        child.name(),
                        path
                    ),
                });
            }
            let alias = path.rsplit('/').next().unwrap_or(&path).to_string();
            let child_config = child.config();
            let link = Link {
                name: path.clone(),
                alias,
                child_ip: child.network_settings().ip_address,
                child_env: child_config.env,
                ports: child_config.exposed_ports.into_iter().collect(),
            };
            env.extend(link.env());
        }
        Ok(env)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Drops limits this host cannot enforce.
    fn verify_daemon_settings(&self, container: &Container) {
        let mut inner = container.write();
        if inner.config.memory > 0 && !self.sysinfo.memory_limit {
            warn!("kernel does not support memory limit capabilities, limitation discarded");
            inner.config.memory = 0;
        }
        if inner.config.memory > 0 && !self.sysinfo.swap_limit {
            warn!("kernel does not support swap limit capabilities, limitation discarded");
            inner.config.memory_swap = -1;
        }
        if self.sysinfo.ipv4_forwarding_disabled {
            warn!("IPv4 forwarding is disabled, networking will not work");
        }
        if inner.host_config.oom_kill_disable && !self.sysinfo.oom_kill_disable {
            warn!("kernel does not support OOM kill disable, setting discarded");
            inner.host_config.oom_kill_disable = false;
        }
    }

    fn populate_command(&self, container: &Container, rootfs: &Path, env: Vec<String>) -> Result<Command> {
        let host_config = container.host_config();
        let config = container.config();

        let mut network = Network {
            mtu: self.config.mtu,
            ..Default::default()
        };
        if host_config.network_mode.is_host() {
            network.host_networking = true;
        } else if let Some(name) = host_config.network_mode.container() {
            network.container_id = Some(self.networked_container(container, name)?.id.clone());
        } else if !config.network_disabled {
            let settings = container.network_settings();
            if settings.is_allocated() {
                network.interface = Some(NetworkInterface {
                    bridge: settings.bridge,
                    ip_address: settings.ip_address,
                    ip_prefix_len: settings.ip_prefix_len,
                    mac_address: settings.mac_address,
                    gateway: settings.gateway,
                });
            }
        }

        let mut mounts = Vec::with_capacity(host_config.binds.len() + 3);
        for bind in &host_config.binds {
            mounts.push(parse_bind(bind)?);
        }
        let inner = container.read();
        for (source, destination) in [
            (&inner.resolv_conf_path, "/etc/resolv.conf"),
            (&inner.hostname_path, "/etc/hostname"),
            (&inner.hosts_path, "/etc/hosts"),
        ] {
            if let Some(source) = source {
                mounts.push(Mount {
                    source: source.clone(),
                    destination: destination.to_string(),
                    writable: true,
                });
            }
        }

        Ok(Command {
            id: container.id.clone(),
            rootfs: rootfs.to_path_buf(),
            entrypoint: container.path.clone(),
            arguments: container.args.clone(),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            env,
            tty: config.tty,
            hostname: config.hostname.clone(),
            network,
            resources: Resources {
                memory: config.memory,
                memory_swap: config.memory_swap,
                cpu_shares: config.cpu_shares,
                cpuset: config.cpuset.clone(),
                oom_kill_disable: host_config.oom_kill_disable,
            },
            privileged: host_config.privileged,
            cap_add: host_config.cap_add.clone(),
            cap_drop: host_config.cap_drop.clone(),
            mount_label: inner.mount_label.clone(),
            process_label: inner.process_label.clone(),
            mounts,
        })
    }

    /// Spawns the monitor and waits until the process runs or fails to.
    async fn wait_for_start(&self, container: &Arc<Container>) -> Result<()> {
        container.reset_monitor();
        container.write().restart_count = 0;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(monitor::run(self.handle()?, container.clone(), tx));

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::StartFailed {
                id: container.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::StartFailed {
                id: container.id.clone(),
                reason: "monitor exited before the process started".to_string(),
            }),
        }
    }
}

fn first_non_empty(own: &[String], daemon: &[String]) -> Option<Vec<String>> {
    [own, daemon]
        .into_iter()
        .find(|list| !list.is_empty())
        .map(<[String]>::to_vec)
}

/// Creates the working directory inside the rootfs.
fn setup_working_directory(container: &Container, rootfs: &Path) -> Result<()> {
    let working_dir = container.config().working_dir;
    if working_dir.is_empty() {
        return Ok(());
    }
    let path = resolve_in_root(rootfs, Path::new(&working_dir))?;
    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::InvalidConfig(format!(
            "cannot mkdir: {} is not a directory",
            working_dir
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(&path)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Environment of the container process, container values winning.
fn create_daemon_environment(container: &Container, linked_env: Vec<String>) -> Vec<String> {
    let config = container.config();
    let mut env = vec![
        format!("PATH={}", DEFAULT_PATH_ENV),
        format!("HOSTNAME={}", config.hostname),
        "HOME=/".to_string(),
    ];
    if config.tty {
        env.push("TERM=xterm".to_string());
    }
    env.extend(linked_env);
    replace_or_append(&mut env, &config.env);
    env
}

/// Parses `source:destination[:ro|:rw]`.
fn parse_bind(bind: &str) -> Result<Mount> {
    let parts: Vec<&str> = bind.split(':').collect();
    let (source, destination, writable) = match parts.as_slice() {
        [source, destination] => (*source, *destination, true),
        [source, destination, "rw"] => (*source, *destination, true),
        [source, destination, "ro"] => (*source, *destination, false),
        _ => return Err(Error::InvalidConfig(format!("invalid bind mount '{}'", bind))),
    };
    if !source.starts_with('/') || !destination.starts_with('/') {
        return Err(Error::InvalidConfig(format!(
            "bind mount paths must be absolute: '{}'",
            bind
        )));
    }
    Ok(Mount {
        source: source.into(),
        destination: destination.to_string(),
        writable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        let mount = parse_bind("/srv/data:/data:ro").unwrap();
        assert_eq!(mount.source, Path::new("/srv/data"));
        assert_eq!(mount.destination, "/data");
        assert!(!mount.writable);
        assert!(parse_bind("/a:/b").unwrap().writable);

        assert!(parse_bind("/a").is_err());
        assert!(parse_bind("rel:/b").is_err());
        assert!(parse_bind("/a:/b:rx").is_err());
    }

    #[test]
    fn test_first_non_empty() {
        let own = vec!["10.0.0.1".to_string()];
        let daemon = vec!["10.0.0.2".to_string()];
        assert_eq!(first_non_empty(&own, &daemon), Some(own.clone()));
        assert_eq!(first_non_empty(&[], &daemon), Some(daemon.clone()));
        assert_eq!(first_non_empty(&[], &[]), None);
    }
}
