//! Container run state.
//!
//! ```text
//!   ┌─────────┐  start   ┌─────────┐  pause   ┌────────┐
//!   │ Created │ ───────► │ Running │ ───────► │ Paused │
//!   └─────────┘          └────┬────┘ ◄─────── └────────┘
//!                             │ exit   unpause
//!                             ▼
//!                        ┌─────────┐  start
//!                        │ Stopped │ ───────► Running
//!                        └─────────┘
//! ```
//!
//! `Restarting` only exists while the monitor waits to rerun a process
//! under its restart policy; `running` stays true meanwhile, so waiters on
//! [`StateHandle::wait_stop`] do not wake up between runs.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Derived lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Running,
    Paused,
    Restarting,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted run state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub pid: i32,
    pub exit_code: i32,
    /// Last start error, empty if none.
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn status(&self) -> Status {
        if self.running {
            if self.paused {
                Status::Paused
            } else if self.restarting {
                Status::Restarting
            } else {
                Status::Running
            }
        } else if self.started_at.is_none() && self.finished_at.is_none() && self.error.is_empty() {
            Status::Created
        } else {
            Status::Stopped
        }
    }

    fn set_running(&mut self, pid: i32) {
        self.running = true;
        self.paused = false;
        self.restarting = false;
        self.pid = pid;
        self.exit_code = 0;
        self.error.clear();
        self.started_at = Some(Utc::now());
    }

    fn set_stopped(&mut self, exit_code: i32) {
        self.running = false;
        self.paused = false;
        self.restarting = false;
        self.pid = 0;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    fn set_restarting(&mut self, exit_code: i32) {
        // Stays "running" so waiters keep waiting across the restart.
        self.running = true;
        self.paused = false;
        self.restarting = true;
        self.pid = 0;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status() {
            Status::Stopped => write!(f, "stopped ({})", self.exit_code),
            status => write!(f, "{}", status),
        }
    }
}

/// Shared, observable container state.
#[derive(Debug)]
pub struct StateHandle {
    state: Mutex<State>,
    running: watch::Sender<bool>,
}

impl StateHandle {
    pub fn new(state: State) -> Self {
        let (running, _) = watch::channel(state.running);
        Self {
            state: Mutex::new(state),
            running,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.running.send_replace(state.running);
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_restarting(&self) -> bool {
        self.lock().restarting
    }

    pub fn pid(&self) -> i32 {
        self.lock().pid
    }

    pub fn exit_code(&self) -> i32 {
        self.lock().exit_code
    }

    pub fn status(&self) -> Status {
        self.lock().status()
    }

    pub fn set_running(&self, pid: i32) {
        let mut state = self.lock();
        state.set_running(pid);
        self.publish(&state);
    }

    pub fn set_stopped(&self, exit_code: i32) {
        let mut state = self.lock();
        state.set_stopped(exit_code);
        self.publish(&state);
    }

    pub fn set_restarting(&self, exit_code: i32) {
        let mut state = self.lock();
        state.set_restarting(exit_code);
        self.publish(&state);
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    /// Records a start failure. An unset exit code becomes `default_code`.
    ///
    /// A container that failed its first start reports [`Status::Stopped`].
    pub fn set_error(&self, error: &str, default_code: i32) {
        let mut state = self.lock();
        state.error = error.to_string();
        state.finished_at = Some(Utc::now());
        if state.exit_code == 0 {
            state.exit_code = default_code;
        }
    }

    /// Waits until the container is no longer running and returns its exit code.
    ///
    /// With a timeout, gives up with [`Error::Timeout`] once it elapses.
    pub async fn wait_stop(&self, timeout: Option<Duration>) -> Result<i32> {
        let mut rx = self.running.subscribe();
        let stopped = async {
            rx.wait_for(|running| !*running)
                .await
                .map(|_| ())
                .map_err(|e| Error::Internal(format!("state channel closed: {}", e)))
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, stopped)
                .await
                .map_err(|_| Error::Timeout {
                    operation: "wait for container to stop".to_string(),
                    duration,
                })??,
            None => stopped.await?,
        }
        Ok(self.exit_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_status_transitions() {
        let handle = StateHandle::new(State::default());
        assert_eq!(handle.status(), Status::Created);
        handle.set_running(42);
        assert_eq!(handle.status(), Status::Running);
        handle.set_paused(true);
        assert_eq!(handle.status(), Status::Paused);
        handle.set_stopped(3);
        assert_eq!(handle.status(), Status::Stopped);
        assert_eq!(handle.pid(), 0);
        assert!(!handle.is_paused());
    }

    #[test]
    fn test_set_error_keeps_existing_code() {
        let handle = StateHandle::new(State::default());
        handle.set_error("boom", 128);
        assert_eq!(handle.exit_code(), 128);
        handle.set_stopped(7);
        handle.set_error("again", 128);
        assert_eq!(handle.exit_code(), 7);
    }

    #[test]
    fn test_failed_first_start_is_stopped() {
        let handle = StateHandle::new(State::default());
        handle.set_error("exec failed", 128);

        let state = handle.snapshot();
        assert_eq!(state.status(), Status::Stopped);
        assert!(state.started_at.is_none());
        assert!(state.finished_at.is_some());
        assert_eq!(state.to_string(), "stopped (128)");
    }

    #[tokio::test]
    async fn test_wait_stop_times_out_while_running() {
        let handle = StateHandle::new(State::default());
        handle.set_running(1);
        let result = handle.wait_stop(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_stop_wakes_on_exit() {
        let handle = Arc::new(StateHandle::new(State::default()));
        handle.set_running(1);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_stop(None).await })
        };
        tokio::task::yield_now().await;
        handle.set_stopped(9);
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_wait_stop_returns_immediately_when_stopped() {
        let handle = StateHandle::new(State::default());
        assert_eq!(handle.wait_stop(None).await.unwrap(), 0);
    }
}
