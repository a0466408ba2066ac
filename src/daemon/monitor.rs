//! Container monitor.
//!
//! One task per started container. It runs the process through the exec
//! driver, reports the first start back to the caller, and on exit either
//! restarts the process according to the restart policy or tears the
//! container down.
//!
//! ```text
//!   run ──exit──► policy says restart? ──yes──► Restarting ──backoff──► run
//!                        │no / user stop
//!                        ▼
//!                 cleanup, Stopped(exit code), persist
//! ```
//!
//! Back-off starts at 100ms and doubles on every restart. A process that
//! stayed up for at least 10 seconds resets it.

use super::Daemon;
use crate::constants::{RESTART_BACKOFF_INITIAL, RESTART_BACKOFF_RESET, RUN_ERROR_EXIT_CODE};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::execdriver::{Pipes, StartCallback};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type StartSignal = Arc<Mutex<Option<oneshot::Sender<Result<()>>>>>;

fn take(signal: &StartSignal) -> Option<oneshot::Sender<Result<()>>> {
    signal.lock().unwrap_or_else(|e| e.into_inner()).take()
}

pub(super) async fn run(daemon: Arc<Daemon>, container: Arc<Container>, started: oneshot::Sender<Result<()>>) {
    let started: StartSignal = Arc::new(Mutex::new(Some(started)));
    let mut backoff = RESTART_BACKOFF_INITIAL;

    let exit_code = loop {
        let stdin = container
            .config()
            .open_stdin
            .then(|| container.streams.take_stdin_reader());
        let pipes = Pipes {
            stdin,
            stdout: container.streams.stdout.clone(),
            stderr: container.streams.stderr.clone(),
        };

        let on_start: StartCallback = {
            let container = container.clone();
            let started = started.clone();
            Box::new(move |info| {
                container.state.set_running(info.pid);
                if let Err(e) = container.to_disk() {
                    warn!("failed to persist {}: {}", container.id, e);
                }
                if let Some(tx) = take(&started) {
                    let _ = tx.send(Ok(()));
                }
            })
        };

        let began = Instant::now();
        let exit_code = match daemon.exec_driver.run(&container.command(), pipes, on_start).await {
            Ok(status) => {
                if status.oom_killed {
                    warn!("container {} was killed by the OOM killer", container.id);
                }
                status.exit_code
            }
            Err(e) => {
                if let Some(tx) = take(&started) {
                    let _ = tx.send(Err(e));
                    return;
                }
                error!("error running container {}: {}", container.id, e);
                RUN_ERROR_EXIT_CODE
            }
        };

        // Never reported running: the caller's start fails and cleans up.
        if let Some(tx) = take(&started) {
            let _ = tx.send(Err(Error::StartFailed {
                id: container.id.clone(),
                reason: format!("process exited with code {} before it started", exit_code),
            }));
            return;
        }

        if began.elapsed() >= RESTART_BACKOFF_RESET {
            backoff = RESTART_BACKOFF_INITIAL;
        }

        let policy = container.host_config().restart_policy;
        if container.user_stopped() || !policy.should_restart(exit_code, container.restart_count()) {
            break exit_code;
        }

        // Registered before the flag check so a stop in between is not lost.
        let stop = container.stop_requested();
        tokio::pin!(stop);

        container.write().restart_count += 1;
        container.state.set_restarting(exit_code);
        if let Err(e) = container.to_disk() {
            warn!("failed to persist {}: {}", container.id, e);
        }
        info!(
            "restarting container {} (exit code {}, policy {}) in {:?}",
            container.id, exit_code, policy, backoff
        );

        if container.user_stopped() {
            break exit_code;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = &mut stop => {}
        }
        if container.user_stopped() {
            break exit_code;
        }
        backoff = backoff.saturating_mul(2);
    };

    debug!("container {} exited with code {}", container.id, exit_code);
    daemon.cleanup(&container).await;
    container.state.set_stopped(exit_code);
    if let Err(e) = container.to_disk() {
        warn!("failed to persist {}: {}", container.id, e);
    }
}
