//! Signals, stop, restart, pause.

use super::Daemon;
use crate::constants::KILL_WAIT_TIMEOUT;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::execdriver::Signal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

impl Daemon {
    /// Sends `signal` to a container's main process.
    ///
    /// Any signal sent through here marks the container as stopped by the
    /// user, so its exit does not trigger the restart policy. A container
    /// waiting to be restarted is not signalled; it simply stays down.
    /// Waits for an in-flight start or stop of the same container.
    pub async fn kill_signal(&self, container: &Container, signal: Signal) -> Result<()> {
        let _op = container.op_lock.lock().await;
        self.signal_locked(container, signal).await
    }

    async fn signal_locked(&self, container: &Container, signal: Signal) -> Result<()> {
        if !container.state.is_running() {
            return Ok(());
        }
        debug!("sending {} to {}", signal, container.id);

        container.exit_on_next();
        if container.state.is_restarting() {
            return Ok(());
        }

        self.exec_driver
            .kill(&container.command(), signal)
            .await
            .map_err(|e| Error::SignalFailed {
                id: container.id.clone(),
                reason: e.to_string(),
            })
    }

    /// Kills a container and waits until it is gone.
    ///
    /// If the process survives `SIGKILL` through the driver for 10 seconds,
    /// it is killed directly by PID.
    pub async fn kill(&self, container: &Container) -> Result<()> {
        let _op = container.op_lock.lock().await;
        self.kill_locked(container).await
    }

    async fn kill_locked(&self, container: &Container) -> Result<()> {
        if !container.state.is_running() {
            return Ok(());
        }
        self.signal_locked(container, Signal::Kill).await?;

        if let Err(e) = container.state.wait_stop(Some(KILL_WAIT_TIMEOUT)).await {
            if !matches!(e, Error::Timeout { .. }) {
                return Err(e);
            }
            let pid = container.state.pid();
            if pid > 0 {
                info!(
                    "container {} failed to exit within {:?} of kill, sending SIGKILL to pid {}",
                    container.id, KILL_WAIT_TIMEOUT, pid
                );
                kill_pid(pid)?;
            }
        }

        container.state.wait_stop(None).await?;
        Ok(())
    }

    /// Stops a container: `SIGTERM`, then [`Daemon::kill`] after `timeout`.
    ///
    /// A start in flight finishes first; the container it brought up is
    /// then stopped.
    pub async fn stop(&self, container: &Container, timeout: Duration) -> Result<()> {
        let _op = container.op_lock.lock().await;
        self.stop_locked(container, timeout).await
    }

    async fn stop_locked(&self, container: &Container, timeout: Duration) -> Result<()> {
        if !container.state.is_running() {
            return Ok(());
        }

        if let Err(e) = self.signal_locked(container, Signal::Term).await {
            info!("failed to send SIGTERM to {}, force killing: {}", container.id, e);
            self.signal_locked(container, Signal::Kill).await?;
        }

        if container.state.wait_stop(Some(timeout)).await.is_err() {
            info!(
                "container {} failed to exit within {:?} of SIGTERM, using the force",
                container.id, timeout
            );
            if let Err(e) = self.kill_locked(container).await {
                container.state.wait_stop(None).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops then starts a container.
    pub async fn restart(&self, container: &Arc<Container>, timeout: Duration) -> Result<()> {
        let _op = container.op_lock.lock().await;
        self.stop_locked(container, timeout).await?;
        self.start_locked(container).await
    }

    /// Freezes a running container.
    pub async fn pause(&self, container: &Container) -> Result<()> {
        if !container.state.is_running() || container.state.is_paused() {
            return Err(Error::InvalidState {
                id: container.id.clone(),
                state: container.state.status().to_string(),
                expected: "running".to_string(),
            });
        }
        self.exec_driver.pause(&container.command()).await?;
        container.state.set_paused(true);
        info!("paused container {}", container.id);
        Ok(())
    }

    /// Thaws a paused container.
    pub async fn unpause(&self, container: &Container) -> Result<()> {
        if !container.state.is_running() || !container.state.is_paused() {
            return Err(Error::InvalidState {
                id: container.id.clone(),
                state: container.state.status().to_string(),
                expected: "paused".to_string(),
            });
        }
        self.exec_driver.unpause(&container.command()).await?;
        container.state.set_paused(false);
        info!("unpaused container {}", container.id);
        Ok(())
    }
}

/// `SIGKILL` by PID. A process that is already gone counts as killed.
fn kill_pid(pid: i32) -> Result<()> {
    // SAFETY: kill(2) has no memory safety requirements.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("cannot kill process (pid={}) with SIGKILL: no such process", pid);
        return Ok(());
    }
    Err(Error::SignalFailed {
        id: pid.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_pid_missing_process_is_ok() {
        // PIDs above pid_max never exist.
        kill_pid(i32::MAX).unwrap();
    }
}
