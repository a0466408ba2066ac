//! Container networking: interfaces, host ports, hostname and hosts files.
//!
//! | Mode                | Interface          | hosts / hostname                  |
//! |---------------------|--------------------|-----------------------------------|
//! | host                | host's             | host's hosts copied, host name    |
//! | `container:<name>`  | other container's  | other container's files           |
//! | daemon disabled     | none               | built with `127.0.1.1`            |
//! | bridge              | from the backend   | built with the assigned address   |
//!
//! Once an interface is allocated, every later failure releases it before
//! the error is returned.

use super::Daemon;
use crate::container::{Container, NetworkSettings};
use crate::error::{Error, Result};
use crate::etchosts::{self, Record};
use crate::fsutil::write_atomic;
use crate::network::{InterfaceRequest, NetworkBackend, PortRequest};
use crate::runconfig::{Port, PortBinding, PortMap, parse_port_specs};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Daemon {
    /// Allocates an interface and the published ports of a container.
    ///
    /// Does nothing when networking is disabled or the container does not
    /// use a private network.
    pub async fn allocate_network(&self, container: &Container) -> Result<()> {
        let Some(network) = &self.network else {
            return Ok(());
        };
        if self.config.disable_network || !container.has_private_network() {
            return Ok(());
        }

        let mac = container.config().mac_address;
        let iface = network
            .allocate_interface(
                &container.id,
                InterfaceRequest {
                    requested_mac: (!mac.is_empty()).then_some(mac),
                    requested_ip: None,
                },
            )
            .await?;

        let ports = match self.bind_ports(network, container).await {
            Ok(ports) => ports,
            Err(e) => {
                release_interface(network, &container.id).await;
                return Err(e);
            }
        };

        info!("allocated {} to container {}", iface.ip_address, container.id);
        container.write().network_settings = NetworkSettings {
            ip_address: iface.ip_address,
            ip_prefix_len: iface.ip_prefix_len,
            mac_address: iface.mac_address,
            gateway: iface.gateway,
            bridge: iface.bridge,
            ports,
        };
        Ok(())
    }

    async fn bind_ports(&self, network: &Arc<dyn NetworkBackend>, container: &Container) -> Result<PortMap> {
        let (exposed, mut bindings, publish_all) = {
            let mut inner = container.write();
            if !inner.config.port_specs.is_empty() {
                let (exposed, bindings) = parse_port_specs(&inner.config.port_specs)?;
                inner.config.exposed_ports.extend(exposed);
                inner.host_config.port_bindings.extend(bindings);
                inner.config.port_specs.clear();
            }
            (
                inner.config.exposed_ports.clone(),
                inner.host_config.port_bindings.clone(),
                inner.host_config.publish_all_ports,
            )
        };

        let mut ports = PortMap::new();
        for port in exposed {
            let mut requested = bindings.remove(&port).unwrap_or_default();
            if publish_all && requested.is_empty() {
                requested.push(PortBinding::default());
            }
            let mut allocated = Vec::with_capacity(requested.len());
            for binding in &requested {
                allocated.push(allocate_port(network, &container.id, &port, binding).await?);
            }
            ports.insert(port, allocated);
        }
        container.write_host_config()?;
        Ok(ports)
    }

    /// Reclaims the address and ports a container held before, for a
    /// container whose allocation outlived the backend's state.
    pub async fn restore_network(&self, container: &Container) -> Result<()> {
        let Some(network) = &self.network else {
            return Ok(());
        };
        let settings = container.network_settings();
        if !settings.is_allocated() || !container.has_private_network() {
            return Ok(());
        }

        network
            .allocate_interface(
                &container.id,
                InterfaceRequest {
                    requested_mac: (!settings.mac_address.is_empty())
                        .then(|| settings.mac_address.clone()),
                    requested_ip: Some(settings.ip_address.clone()),
                },
            )
            .await?;

        let mut ports = settings.ports;
        for (port, bindings) in ports.iter_mut() {
            for binding in bindings.iter_mut() {
                match allocate_port(network, &container.id, port, binding).await {
                    Ok(bound) => *binding = bound,
                    Err(e) => {
                        release_interface(network, &container.id).await;
                        return Err(e);
                    }
                }
            }
        }
        container.write().network_settings.ports = ports;
        debug!("restored network of {}", container.id);
        Ok(())
    }

    /// Returns a container's interface and ports to the backend.
    pub async fn release_network(&self, container: &Container) {
        if !container.has_private_network() {
            return;
        }
        if let Some(network) = &self.network {
            release_interface(network, &container.id).await;
        }
        container.write().network_settings = NetworkSettings::default();
    }

    /// Releases everything a start set up.
    pub(super) async fn cleanup(&self, container: &Container) {
        self.release_network(container).await;
        container.streams.close();
        if let Err(e) = self.unmount(container) {
            warn!("{}: failed to unmount filesystem: {}", container.id, e);
        }
    }

    // =========================================================================
    // Hostname & Hosts
    // =========================================================================

    pub(super) async fn initialize_networking(&self, container: &Container) -> Result<()> {
        let network_mode = container.host_config().network_mode;

        if network_mode.is_host() {
            let full = host_name()?;
            {
                let mut inner = container.write();
                match full.split_once('.') {
                    Some((hostname, domainname)) => {
                        inner.config.hostname = hostname.to_string();
                        inner.config.domainname = domainname.to_string();
                    }
                    None => inner.config.hostname = full,
                }
            }

            let content = match fs::read(&self.config.host_hosts) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return self.build_hostname_and_hosts_files(container, "");
                }
                Err(e) => return Err(e.into()),
            };
            build_hostname_file(container)?;
            let hosts_path = container.resource_path("hosts");
            write_atomic(&hosts_path, &content)?;
            container.write().hosts_path = Some(hosts_path);
            return Ok(());
        }

        if let Some(name) = network_mode.container() {
            let other = self.networked_container(container, name)?;
            let (hosts_path, resolv_conf_path, config) =
                (other.hosts_path(), other.resolv_conf_path(), other.config());
            let mut inner = container.write();
            inner.hosts_path = hosts_path;
            inner.resolv_conf_path = resolv_conf_path;
            inner.config.hostname = config.hostname;
            inner.config.domainname = config.domainname;
            return Ok(());
        }

        if self.config.disable_network {
            container.write().config.network_disabled = true;
            return self.build_hostname_and_hosts_files(container, "127.0.1.1");
        }

        self.allocate_network(container).await?;
        let ip = container.network_settings().ip_address;
        self.build_hostname_and_hosts_files(container, &ip)
    }

    /// The running container whose network stack `container` joins.
    pub(super) fn networked_container(&self, container: &Container, name: &str) -> Result<Arc<Container>> {
        let other = self
            .get(name)
            .map_err(|_| Error::ContainerNotFound(format!("no such container to join network: {}", name)))?;
        if !other.state.is_running() {
            return Err(Error::StartFailed {
                id: container.id.clone(),
                reason: format!("cannot join network of a non running container: {}", name),
            });
        }
        Ok(other)
    }

    fn build_hostname_and_hosts_files(&self, container: &Container, ip: &str) -> Result<()> {
        build_hostname_file(container)?;

        let mut extra = Vec::new();
        for (path, child) in self.children(&container.name())? {
            let alias = path.rsplit('/').next().unwrap_or(&path);
            extra.push(Record {
                hosts: alias.to_string(),
                ip: child.network_settings().ip_address,
            });
        }
        for entry in &container.host_config().extra_hosts {
            let Some((host, addr)) = entry.split_once(':') else {
                return Err(Error::InvalidConfig(format!("invalid extra host '{}'", entry)));
            };
            extra.push(Record {
                hosts: host.to_string(),
                ip: addr.to_string(),
            });
        }

        let config = container.config();
        let hosts_path = container.resource_path("hosts");
        etchosts::build(&hosts_path, ip, &config.hostname, &config.domainname, &extra)?;
        container.write().hosts_path = Some(hosts_path);
        Ok(())
    }
}

fn build_hostname_file(container: &Container) -> Result<()> {
    let config = container.config();
    let mut hostname = config.hostname;
    if !config.domainname.is_empty() {
        hostname = format!("{}.{}", hostname, config.domainname);
    }
    hostname.push('\n');

    let path = container.resource_path("hostname");
    write_atomic(&path, hostname.as_bytes())?;
    container.write().hostname_path = Some(path);
    Ok(())
}

async fn allocate_port(
    network: &Arc<dyn NetworkBackend>,
    id: &str,
    port: &Port,
    binding: &PortBinding,
) -> Result<PortBinding> {
    let host_port = if binding.host_port.is_empty() {
        0
    } else {
        binding.host_port.parse().map_err(|_| {
            Error::InvalidConfig(format!("invalid host port '{}' for {}", binding.host_port, port))
        })?
    };
    let bound = network
        .allocate_port(
            id,
            PortRequest {
                host_ip: binding.host_ip.clone(),
                host_port,
                proto: port.proto().to_string(),
                container_port: port.number()?,
            },
        )
        .await?;
    Ok(PortBinding {
        host_ip: bound.host_ip,
        host_port: bound.host_port.to_string(),
    })
}

async fn release_interface(network: &Arc<dyn NetworkBackend>, id: &str) {
    if let Err(e) = network.release_interface(id).await {
        warn!("failed to release network of {}: {}", id, e);
    }
}

/// Host name of the machine the daemon runs on.
fn host_name() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}
