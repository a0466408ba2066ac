//! Container run configuration.
//!
//! [`RunConfig`] is what a container runs (command, environment, exposed
//! ports) and is also stored on images as their defaults. [`HostConfig`]
//! is how the host provides for it (port bindings, links, DNS, restart
//! policy, network mode) and may change between runs.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Ports
// =============================================================================

/// A container port with its protocol, e.g. `80/tcp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(String);

impl Port {
    pub fn new(port: u16, proto: &str) -> Self {
        Self(format!("{}/{}", port, proto.to_lowercase()))
    }

    /// Parses `80`, `80/tcp` or `53/udp`. The protocol defaults to tcp.
    pub fn parse(spec: &str) -> Result<Self> {
        let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
        let number: u16 = port
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid port '{}'", spec)))?;
        if !matches!(proto, "tcp" | "udp") {
            return Err(Error::InvalidConfig(format!(
                "invalid protocol '{}' in port '{}'",
                proto, spec
            )));
        }
        Ok(Self::new(number, proto))
    }

    pub fn proto(&self) -> &str {
        self.0.split_once('/').map(|(_, p)| p).unwrap_or("tcp")
    }

    pub fn port(&self) -> &str {
        self.0.split_once('/').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn number(&self) -> Result<u16> {
        self.port()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid port '{}'", self.0)))
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host side binding of a container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBinding {
    /// Host address; empty binds all addresses.
    pub host_ip: String,
    /// Host port; empty lets the network backend choose.
    pub host_port: String,
}

/// Container port to host bindings.
pub type PortMap = BTreeMap<Port, Vec<PortBinding>>;

/// Parses legacy `[ip:][host_port:]container_port[/proto]` specs.
pub fn parse_port_specs(specs: &[String]) -> Result<(BTreeSet<Port>, PortMap)> {
    let mut exposed = BTreeSet::new();
    let mut bindings = PortMap::new();

    for spec in specs {
        let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
        let (container, host_port, host_ip) = match parts.as_slice() {
            [container] => (*container, "", ""),
            [container, host] => (*container, *host, ""),
            [container, host, ip] => (*container, *host, *ip),
            _ => return Err(Error::InvalidConfig(format!("invalid port spec '{}'", spec))),
        };
        if !host_port.is_empty() && host_port.parse::<u16>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "invalid host port in '{}'",
                spec
            )));
        }

        let port = Port::parse(container)?;
        exposed.insert(port.clone());
        bindings.entry(port).or_default().push(PortBinding {
            host_ip: host_ip.trim_matches(|c| c == '[' || c == ']').to_string(),
            host_port: host_port.to_string(),
        });
    }
    Ok((exposed, bindings))
}

// =============================================================================
// Run Configuration
// =============================================================================

/// What a container runs. Immutable once the container is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    /// Memory limit in bytes, 0 for none.
    pub memory: i64,
    /// Memory plus swap limit in bytes, -1 for unlimited swap.
    pub memory_swap: i64,
    pub cpu_shares: i64,
    pub cpuset: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    /// Legacy `ip:host:container` port list, migrated into bindings on start.
    pub port_specs: Vec<String>,
    pub exposed_ports: BTreeSet<Port>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub image: String,
    pub volumes: BTreeSet<String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub network_disabled: bool,
    pub mac_address: String,
    pub on_build: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

impl RunConfig {
    /// Fills unset fields of `self` from an image's defaults.
    pub fn merge(&mut self, image: &RunConfig) -> Result<()> {
        if self.user.is_empty() {
            self.user = image.user.clone();
        }
        if self.memory == 0 {
            self.memory = image.memory;
        }
        if self.memory_swap == 0 {
            self.memory_swap = image.memory_swap;
        }
        if self.cpu_shares == 0 {
            self.cpu_shares = image.cpu_shares;
        }
        if self.cpuset.is_empty() {
            self.cpuset = image.cpuset.clone();
        }

        self.exposed_ports
            .extend(image.exposed_ports.iter().cloned());
        if !image.port_specs.is_empty() {
            let (exposed, _) = parse_port_specs(&image.port_specs)?;
            self.exposed_ports.extend(exposed);
        }

        let env: Vec<String> = image
            .env
            .iter()
            .filter(|entry| !self.env.iter().any(|own| env_key(own) == env_key(entry)))
            .cloned()
            .collect();
        self.env.extend(env);

        if self.on_build.is_empty() {
            self.on_build = image.on_build.clone();
        }

        if self.entrypoint.is_empty() {
            if self.cmd.is_empty() {
                self.cmd = image.cmd.clone();
            }
            self.entrypoint = image.entrypoint.clone();
        }

        if self.working_dir.is_empty() {
            self.working_dir = image.working_dir.clone();
        }
        self.volumes.extend(image.volumes.iter().cloned());
        for (key, value) in &image.labels {
            self.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }

    /// Resolved process path and arguments.
    pub fn entrypoint_and_args(&self) -> (String, Vec<String>) {
        let mut full: Vec<String> = self
            .entrypoint
            .iter()
            .chain(self.cmd.iter())
            .cloned()
            .collect();
        if full.is_empty() {
            return (String::new(), Vec::new());
        }
        let path = full.remove(0);
        (path, full)
    }
}

// =============================================================================
// Host Configuration
// =============================================================================

/// How a container's network namespace is provided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Private namespace attached to the bridge.
    #[default]
    Bridge,
    /// Share the host's namespace.
    Host,
    /// Private namespace with loopback only.
    None,
    /// Share the namespace of another container.
    Container(String),
}

impl NetworkMode {
    /// Gets its own interface from the network backend.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Bridge)
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The other container, for `container:<id>`.
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Container(id) => Some(id),
            _ => None,
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.to_string()
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "bridge" | "default" => Ok(Self::Bridge),
            "host" => Ok(Self::Host),
            "none" => Ok(Self::None),
            other => match other.strip_prefix("container:") {
                Some(id) if !id.is_empty() => Ok(Self::Container(id.to_string())),
                _ => Err(format!("invalid network mode: {}", s)),
            },
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Host => write!(f, "host"),
            Self::None => write!(f, "none"),
            Self::Container(id) => write!(f, "container:{}", id),
        }
    }
}

/// When a container is restarted after it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyName {
    /// Never restart.
    #[default]
    #[serde(alias = "")]
    No,
    /// Restart whatever the exit code.
    Always,
    /// Restart on a non-zero exit code.
    OnFailure,
}

impl std::fmt::Display for RestartPolicyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Restart policy with its retry limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub name: RestartPolicyName,
    /// Retry limit for `on-failure`, 0 for unlimited.
    pub maximum_retry_count: u32,
}

impl RestartPolicy {
    pub fn always() -> Self {
        Self {
            name: RestartPolicyName::Always,
            maximum_retry_count: 0,
        }
    }

    pub fn on_failure(maximum_retry_count: u32) -> Self {
        Self {
            name: RestartPolicyName::OnFailure,
            maximum_retry_count,
        }
    }

    /// Decides whether a container that exited with `exit_code` after
    /// `restart_count` restarts should run again.
    pub fn should_restart(&self, exit_code: i32, restart_count: u32) -> bool {
        match self.name {
            RestartPolicyName::No => false,
            RestartPolicyName::Always => true,
            RestartPolicyName::OnFailure => {
                exit_code != 0
                    && (self.maximum_retry_count == 0 || restart_count < self.maximum_retry_count)
            }
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.name, self.maximum_retry_count) {
            (RestartPolicyName::OnFailure, n) if n > 0 => write!(f, "on-failure:{}", n),
            (name, _) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, Some(count)),
            None => (s, None),
        };
        let name = match name.to_lowercase().as_str() {
            "" | "no" => RestartPolicyName::No,
            "always" => RestartPolicyName::Always,
            "on-failure" => RestartPolicyName::OnFailure,
            _ => return Err(format!("invalid restart policy: {}", s)),
        };
        let maximum_retry_count = match count {
            Some(_) if name != RestartPolicyName::OnFailure => {
                return Err(format!("maximum restart count only valid with on-failure: {}", s));
            }
            Some(count) => count
                .parse()
                .map_err(|_| format!("invalid maximum restart count: {}", s))?,
            None => 0,
        };
        Ok(Self {
            name,
            maximum_retry_count,
        })
    }
}

/// Host side configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub binds: Vec<String>,
    /// `name:alias` entries.
    pub links: Vec<String>,
    pub port_bindings: PortMap,
    pub publish_all_ports: bool,
    pub privileged: bool,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// `host:ip` entries added to the hosts file.
    pub extra_hosts: Vec<String>,
    pub network_mode: NetworkMode,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub oom_kill_disable: bool,
}

/// Parses a `name:alias` link. A bare name is its own alias.
pub fn parse_link(link: &str) -> Result<(String, String)> {
    let name_only = link.trim_start_matches('/');
    let (name, alias) = link.split_once(':').unwrap_or((name_only, name_only));
    let name = name.trim_start_matches('/');
    if name.is_empty() || alias.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid link '{}'", link)));
    }
    Ok((name.to_string(), alias.to_string()))
}
