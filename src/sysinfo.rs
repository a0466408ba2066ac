//! Host capability detection.
//!
//! Probed once at daemon startup. Containers that ask for something the
//! host cannot provide get the request cleared with a warning at start.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resource controls available on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfo {
    /// Memory limits can be enforced.
    pub memory_limit: bool,
    /// Swap limits can be enforced.
    pub swap_limit: bool,
    /// The OOM killer can be disabled per container.
    pub oom_kill_disable: bool,
    /// `net.ipv4.ip_forward` is off.
    pub ipv4_forwarding_disabled: bool,
}

impl Default for SysInfo {
    fn default() -> Self {
        Self {
            memory_limit: true,
            swap_limit: true,
            oom_kill_disable: true,
            ipv4_forwarding_disabled: false,
        }
    }
}

impl SysInfo {
    /// Probes the running host.
    pub fn detect() -> Self {
        Self::detect_at(Path::new("/sys/fs/cgroup"), Path::new("/proc/sys/net/ipv4/ip_forward"))
    }

    /// Probes using explicit cgroup and ip_forward locations.
    pub fn detect_at(cgroup_root: &Path, ip_forward: &Path) -> Self {
        let (memory_limit, swap_limit, oom_kill_disable) = Self::detect_memory(cgroup_root);

        let ipv4_forwarding_disabled = match fs::read_to_string(ip_forward) {
            Ok(value) => value.trim() == "0",
            Err(_) => false,
        };

        let info = Self {
            memory_limit,
            swap_limit,
            oom_kill_disable,
            ipv4_forwarding_disabled,
        };
        debug!("detected host capabilities: {:?}", info);
        info
    }

    /// Returns (memory, swap, oom-kill-disable) support.
    fn detect_memory(cgroup_root: &Path) -> (bool, bool, bool) {
        // cgroup v2: one unified hierarchy with a controllers list
        let controllers = cgroup_root.join("cgroup.controllers");
        if let Ok(list) = fs::read_to_string(&controllers) {
            let memory = list.split_whitespace().any(|c| c == "memory");
            let swap = memory && Self::any_child_has(cgroup_root, "memory.swap.max");
            // v2 has no per-cgroup oom_kill_disable
            return (memory, swap, false);
        }

        let v1: PathBuf = cgroup_root.join("memory");
        if !v1.is_dir() {
            return (false, false, false);
        }
        (
            v1.join("memory.limit_in_bytes").exists(),
            v1.join("memory.memsw.limit_in_bytes").exists(),
            v1.join("memory.oom_control").exists(),
        )
    }

    fn any_child_has(root: &Path, file: &str) -> bool {
        if root.join(file).exists() {
            return true;
        }
        fs::read_dir(root)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.path().is_dir() && e.path().join(file).exists())
            })
            .unwrap_or(false)
    }
}
