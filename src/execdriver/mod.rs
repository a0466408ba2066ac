//! # Execution Driver
//!
//! The process-execution backend consumed by the lifecycle code. The engine
//! never forks or enters namespaces itself: it composes a [`Command`] and
//! hands it to an [`ExecDriver`], which runs the process to completion.
//!
//! ## Run Protocol
//!
//! ```text
//!  monitor                        ExecDriver
//!  ───────                        ──────────
//!  run(command, pipes, on_start) ─►  spawn process
//!                                    on_start(ProcessInfo { pid })
//!  set_running(pid)  ◄───────────────┘
//!                                    ... process runs ...
//!  set_stopped(code) ◄────────────── ExitStatus { exit_code }
//! ```
//!
//! `run` only returns once the process has exited. A driver that fails
//! before calling the start callback returns an error instead, which the
//! start sequence reports as a failed start.
//!
//! ## Optional Operations
//!
//! `exec`, `pause` and `unpause` default to [`Error::NotSupported`]; the
//! lifecycle code propagates that error unchanged.

use crate::error::{Error, Result};
use crate::streams::BroadcastWriter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::DuplexStream;

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGQUIT.
    Quit,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Maps a signal number back to a [`Signal`].
    pub fn from_i32(signo: i32) -> Option<Self> {
        [
            Self::Term,
            Self::Kill,
            Self::Hup,
            Self::Int,
            Self::Quit,
            Self::Usr1,
            Self::Usr2,
        ]
        .into_iter()
        .find(|s| s.as_i32() == signo)
    }
}

impl std::str::FromStr for Signal {
    type Err = Error;

    /// Parses a signal name or number ("SIGTERM", "term", "15").
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        let signal = match name {
            "TERM" => Some(Self::Term),
            "KILL" => Some(Self::Kill),
            "HUP" => Some(Self::Hup),
            "INT" => Some(Self::Int),
            "QUIT" => Some(Self::Quit),
            "USR1" => Some(Self::Usr1),
            "USR2" => Some(Self::Usr2),
            number => number.parse().ok().and_then(Self::from_i32),
        };
        signal.ok_or_else(|| Error::InvalidConfig(format!("invalid signal: {}", s)))
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Quit => write!(f, "SIGQUIT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Command
// =============================================================================

/// Network interface handed to the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub bridge: String,
    pub ip_address: String,
    pub ip_prefix_len: u8,
    pub mac_address: String,
    pub gateway: String,
}

/// Network setup for the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub mtu: u32,
    /// Private interface, absent for host, container or disabled networking.
    pub interface: Option<NetworkInterface>,
    /// ID of the container whose network stack is joined.
    pub container_id: Option<String>,
    pub host_networking: bool,
}

/// Resource limits applied to the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory: i64,
    pub memory_swap: i64,
    pub cpu_shares: i64,
    pub cpuset: String,
    pub oom_kill_disable: bool,
}

/// Bind mount into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: String,
    pub writable: bool,
}

/// Everything an execution driver needs to run a container process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Container ID.
    pub id: String,
    /// Mounted root filesystem.
    pub rootfs: PathBuf,
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub working_dir: String,
    pub user: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub tty: bool,
    pub hostname: String,
    pub network: Network,
    pub resources: Resources,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub mount_label: String,
    pub process_label: String,
    pub mounts: Vec<Mount>,
}

impl Command {
    /// A command carrying only the container ID.
    ///
    /// Used to address a process left over from a previous daemon run.
    pub fn for_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Process started inside an already running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub tty: bool,
    pub user: String,
    pub privileged: bool,
}

// =============================================================================
// Run Results
// =============================================================================

/// Standard streams wired to a process.
pub struct Pipes {
    /// Read end of the stdin pipe, if the container keeps stdin open.
    pub stdin: Option<DuplexStream>,
    pub stdout: Arc<BroadcastWriter>,
    pub stderr: Arc<BroadcastWriter>,
}

impl std::fmt::Debug for Pipes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipes")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Information passed to the start callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i32,
    pub oom_killed: bool,
}

/// Called by the driver once the process is running.
pub type StartCallback = Box<dyn FnOnce(ProcessInfo) + Send>;

/// Resource usage of a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub cpu_usage_ns: u64,
    pub pids: u64,
}

// =============================================================================
// ExecDriver Trait
// =============================================================================

/// Backend that runs container processes.
#[async_trait]
pub trait ExecDriver: Send + Sync {
    /// Returns the driver name.
    fn name(&self) -> &str;

    /// Runs the process described by `command` until it exits.
    ///
    /// `start` must be called once the process is running, before the
    /// driver waits for it.
    async fn run(&self, command: &Command, pipes: Pipes, start: StartCallback)
    -> Result<ExitStatus>;

    /// Runs an additional process inside a running container.
    async fn exec(&self, command: &Command, process: &ProcessConfig, pipes: Pipes) -> Result<i32> {
        let _ = (process, pipes);
        Err(Error::NotSupported(format!(
            "{} cannot exec in container {}",
            self.name(),
            command.id
        )))
    }

    /// Delivers `signal` to the container's main process.
    async fn kill(&self, command: &Command, signal: Signal) -> Result<()>;

    /// Freezes every process of the container.
    async fn pause(&self, command: &Command) -> Result<()> {
        Err(Error::NotSupported(format!(
            "{} cannot pause container {}",
            self.name(),
            command.id
        )))
    }

    /// Thaws a paused container.
    async fn unpause(&self, command: &Command) -> Result<()> {
        Err(Error::NotSupported(format!(
            "{} cannot unpause container {}",
            self.name(),
            command.id
        )))
    }

    /// Forcibly ends the container and releases driver resources.
    async fn terminate(&self, command: &Command) -> Result<()>;

    /// Returns true if the driver knows the container as running.
    async fn info(&self, id: &str) -> Result<bool>;

    /// Current resource usage.
    async fn stats(&self, id: &str) -> Result<ResourceStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parse() {
        assert_eq!("SIGTERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("kill".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!("1".parse::<Signal>().unwrap(), Signal::Hup);
        assert!("SIGWHAT".parse::<Signal>().is_err());
        assert!("0".parse::<Signal>().is_err());
    }

    #[test]
    fn test_signal_roundtrip_number() {
        for signal in [Signal::Term, Signal::Kill, Signal::Usr2] {
            assert_eq!(Signal::from_i32(signal.as_i32()), Some(signal));
        }
    }
}
