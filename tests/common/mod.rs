//! Shared fixtures for integration tests.
//!
//! [`MockExecDriver`] runs no processes: a "process" lives until it is
//! killed or terminated, or exits right after starting with a configured
//! code. [`MockNetwork`] wraps the in-memory bridge and counts calls.

#![allow(dead_code)]

use async_trait::async_trait;
use magikd::execdriver::{Command, ExitStatus, Pipes, ProcessInfo, ResourceStats, Signal, StartCallback};
use magikd::network::{
    BridgeNetwork, HostBinding, InterfaceAllocation, InterfaceRequest, NetworkBackend, PortRequest,
};
use magikd::{Daemon, DaemonBackends, DaemonConfig, Error, ExecDriver, Image, Result, RunConfig, SysInfo};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// =============================================================================
// Exec Driver
// =============================================================================

#[derive(Default)]
pub struct MockExecDriver {
    processes: Mutex<HashMap<String, oneshot::Sender<i32>>>,
    next_pid: AtomicI32,
    /// `run` fails before starting anything.
    pub fail_run: AtomicBool,
    /// Processes exit with this code right after starting.
    pub exit_immediately: Mutex<Option<i32>>,
    pub support_pause: AtomicBool,
    /// Time between `run` and the start callback.
    pub start_delay: Mutex<Option<Duration>>,
    /// Processes only die from `Signal::Kill`.
    pub ignore_term: AtomicBool,
    /// Answer of `info`.
    pub report_running: AtomicBool,
    pub runs: AtomicUsize,
    pub commands: Mutex<Vec<Command>>,
    pub signals: Mutex<Vec<(String, Signal)>>,
    pub terminated: Mutex<Vec<String>>,
}

impl MockExecDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicI32::new(1000),
            ..Default::default()
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_command(&self) -> Option<Command> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub fn signals(&self) -> Vec<(String, Signal)> {
        self.signals.lock().unwrap().clone()
    }

    fn end(&self, id: &str, exit_code: i32) -> bool {
        match self.processes.lock().unwrap().remove(id) {
            Some(tx) => tx.send(exit_code).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ExecDriver for MockExecDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, command: &Command, _pipes: Pipes, start: StartCallback) -> Result<ExitStatus> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.clone());
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(Error::ExecDriver("mock run failure".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.processes.lock().unwrap().insert(command.id.clone(), tx);
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        start(ProcessInfo {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
        });

        let immediate = *self.exit_immediately.lock().unwrap();
        if let Some(exit_code) = immediate {
            self.processes.lock().unwrap().remove(&command.id);
            return Ok(ExitStatus {
                exit_code,
                oom_killed: false,
            });
        }

        let exit_code = rx.await.unwrap_or(-1);
        Ok(ExitStatus {
            exit_code,
            oom_killed: false,
        })
    }

    async fn kill(&self, command: &Command, signal: Signal) -> Result<()> {
        self.signals
            .lock()
            .unwrap()
            .push((command.id.clone(), signal));
        if signal != Signal::Kill && self.ignore_term.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.end(&command.id, 128 + signal.as_i32()) {
            Ok(())
        } else {
            Err(Error::ExecDriver(format!("no such process: {}", command.id)))
        }
    }

    async fn pause(&self, command: &Command) -> Result<()> {
        if self.support_pause.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotSupported(format!("mock cannot pause {}", command.id)))
        }
    }

    async fn unpause(&self, command: &Command) -> Result<()> {
        if self.support_pause.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotSupported(format!("mock cannot unpause {}", command.id)))
        }
    }

    async fn terminate(&self, command: &Command) -> Result<()> {
        self.terminated.lock().unwrap().push(command.id.clone());
        self.end(&command.id, 137);
        Ok(())
    }

    async fn info(&self, _id: &str) -> Result<bool> {
        Ok(self.report_running.load(Ordering::SeqCst))
    }

    async fn stats(&self, _id: &str) -> Result<ResourceStats> {
        Ok(ResourceStats::default())
    }
}

// =============================================================================
// Network Backend
// =============================================================================

#[derive(Default)]
pub struct MockNetwork {
    bridge: BridgeNetwork,
    pub calls: AtomicUsize,
    pub releases: AtomicUsize,
    /// `allocate_port` fails.
    pub fail_ports: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> usize {
        self.bridge.allocated()
    }
}

#[async_trait]
impl NetworkBackend for MockNetwork {
    async fn allocate_interface(&self, id: &str, request: InterfaceRequest) -> Result<InterfaceAllocation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bridge.allocate_interface(id, request).await
    }

    async fn release_interface(&self, id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.bridge.release_interface(id).await
    }

    async fn allocate_port(&self, id: &str, request: PortRequest) -> Result<HostBinding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ports.load(Ordering::SeqCst) {
            return Err(Error::NetworkAllocation {
                id: id.to_string(),
                reason: "mock port failure".to_string(),
            });
        }
        self.bridge.allocate_port(id, request).await
    }

    async fn release_all(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bridge.release_all().await
    }
}

// =============================================================================
// Daemon Fixtures
// =============================================================================

pub const HOST_RESOLV_CONF: &str = "nameserver 10.0.0.1\nnameserver 127.0.0.1\nsearch example.com\n";

/// Daemon config under `root` on vfs, with host files inside `root`.
pub fn config(root: &Path) -> DaemonConfig {
    let etc = root.join("host-etc");
    fs::create_dir_all(&etc).unwrap();
    fs::write(etc.join("resolv.conf"), HOST_RESOLV_CONF).unwrap();
    fs::write(etc.join("hosts"), "127.0.0.1\tlocalhost\n").unwrap();

    let mut config = DaemonConfig::with_root(root.join("engine"));
    config.graph_driver = "vfs".to_string();
    config.host_resolv_conf = etc.join("resolv.conf");
    config.host_hosts = etc.join("hosts");
    config
}

pub fn backends(exec: &Arc<MockExecDriver>, network: Option<&Arc<MockNetwork>>) -> DaemonBackends {
    let backends = DaemonBackends::new(exec.clone()).with_sysinfo(SysInfo::default());
    match network {
        Some(network) => backends.with_network(network.clone()),
        None => backends,
    }
}

pub async fn daemon(
    root: &Path,
    exec: &Arc<MockExecDriver>,
    network: Option<&Arc<MockNetwork>>,
) -> Arc<Daemon> {
    Daemon::new(config(root), backends(exec, network)).await.unwrap()
}

/// Registers a base image whose default command is `/bin/app`.
pub fn base_image(daemon: &Daemon) -> Image {
    let config = RunConfig {
        cmd: vec!["/bin/app".to_string()],
        env: vec!["APP_MODE=test".to_string()],
        ..Default::default()
    };
    daemon
        .graph()
        .create(None, "", "", "base image", "tests", None, Some(config))
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
