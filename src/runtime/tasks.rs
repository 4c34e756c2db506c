//! Background task manager: out-of-band, time-bounded remote tasks.
//!
//! Dispatch applies the task's initial effect synchronously, then the
//! hold/repeat behavior keeps running remotely. Dropping the manager (or
//! killing the whole process) never stops a remote effect; termination goes
//! through [`crate::RemoteExecutor::terminate_session`].

use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::{
    EngineClock, HavocError, HavocResult, RemoteExecutor, RemoteHandle, TaskKind, TaskStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub kind: TaskKind,
    pub target: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "dispatchedAtMs")]
    pub dispatched_at_ms: u64,
    pub handle: RemoteHandle,
    pub status: TaskStatus,
}

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<BackgroundTask>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[BackgroundTask] {
        &self.tasks
    }

    /// At most one lock-holder may target a given resource within one
    /// execution context; a second dispatch is rejected before any remote
    /// call is made.
    pub fn dispatch(
        &mut self,
        remote: &dyn RemoteExecutor,
        clock: &EngineClock,
        target: &str,
        kind: TaskKind,
        duration: Duration,
    ) -> HavocResult<&BackgroundTask> {
        if kind == TaskKind::LockHolder
            && self
                .tasks
                .iter()
                .any(|t| {
                    t.kind == TaskKind::LockHolder
                        && t.target == target
                        && t.status != TaskStatus::ConfirmedEnded
                })
        {
            return Err(HavocError::InvalidArgument(format!(
                "a lock-holder already targets {target} in this run"
            )));
        }

        let handle = remote.exec_background(target, kind, duration)?;
        tracing::info!(
            "dispatched {} against {target} for {}s (session {})",
            kind.as_str(),
            duration.as_secs(),
            handle.session
        );
        self.tasks.push(BackgroundTask {
            kind,
            target: target.to_string(),
            duration_ms: duration.as_millis().min(u128::from(u64::MAX)) as u64,
            dispatched_at_ms: clock.now_ms(),
            handle,
            status: TaskStatus::Dispatched,
        });
        Ok(self.tasks.last().expect("just pushed"))
    }

    /// Best-effort status refresh; a failing probe leaves the task Unknown
    /// rather than failing the run.
    pub fn refresh(&mut self, remote: &dyn RemoteExecutor) {
        for task in &mut self.tasks {
            match remote.task_status(&task.handle) {
                Ok(status) => task.status = status,
                Err(err) => {
                    tracing::warn!("status probe for {} failed: {err}", task.handle.session);
                    task.status = TaskStatus::Unknown;
                }
            }
        }
    }
}
