//! The remote-executor seam.
//!
//! Every interaction with the target system goes through [`RemoteExecutor`]
//! as a typed operation; the engine never shells out or parses
//! human-oriented tool output itself. Backends are selected by config the
//! same way for every run: `scripted` (in-memory target, the default) or
//! `host` (kubectl + psql adapter).

use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::{ConstraintSpec, HavocResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBackend {
    Scripted,
    Host,
}

impl clap::ValueEnum for RemoteBackend {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Scripted, Self::Host]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Scripted => clap::builder::PossibleValue::new("scripted"),
            Self::Host => clap::builder::PossibleValue::new("host"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LoadGenerator,
    LockHolder,
    Sampler,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LoadGenerator => "load-generator",
            TaskKind::LockHolder => "lock-holder",
            TaskKind::Sampler => "sampler",
        }
    }
}

/// Minimum information needed to check a dispatched task's liveness or issue
/// the remote termination command. Discarding the handle never stops the
/// remote effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Remote session/process identity owning the effect.
    pub session: String,
    /// Where the task writes its output on the remote side, when it does.
    #[serde(rename = "logPath", skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Dispatched,
    Unknown,
    ConfirmedEnded,
}

/// A pending/blocked sub-resource with its explanatory condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUnit {
    pub name: String,
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub resource: String,
    pub session: String,
    pub granted: bool,
}

/// One point-in-time view of the target used to build a [`crate::Sample`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub desired: u32,
    pub current: u32,
    pub pending: Vec<PendingUnit>,
    pub locks: Vec<LockSnapshot>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupOutcome {
    /// Constraints and sessions removed; 0 on an already-clean target.
    pub removed: usize,
}

/// Typed operations against one target environment. Each call is bounded by
/// the underlying client's own timeout; the engine adds no timeout wrapper.
pub trait RemoteExecutor {
    fn check_connectivity(&self) -> HavocResult<()>;

    fn namespace_exists(&self, namespace: &str) -> HavocResult<bool>;

    /// Existence predicate for one candidate. May itself enumerate several
    /// sub-targets (e.g. databases) before deciding.
    fn probe_resource(&self, id: &str) -> HavocResult<bool>;

    /// Matches in listing order. The order is not guaranteed stable.
    fn list_by_selector(&self, selector: &str) -> HavocResult<Vec<String>>;

    fn apply_constraint(&self, target: &str, spec: &ConstraintSpec) -> HavocResult<()>;

    fn verify_constraint(&self, target: &str) -> HavocResult<bool>;

    fn relax_constraint(&self, target: &str) -> HavocResult<()>;

    fn remove_constraint(&self, target: &str) -> HavocResult<()>;

    /// Applies the task's initial effect synchronously, then leaves the
    /// hold/repeat behavior running remotely for `duration`, independent of
    /// the local process's lifetime.
    fn exec_background(
        &self,
        target: &str,
        kind: TaskKind,
        duration: Duration,
    ) -> HavocResult<RemoteHandle>;

    fn sample_state(&self, target: &str) -> HavocResult<StateSnapshot>;

    fn task_status(&self, handle: &RemoteHandle) -> HavocResult<TaskStatus>;

    /// The only cancellation primitive: terminate the remote session owning
    /// an effect.
    fn terminate_session(&self, session: &str) -> HavocResult<()>;

    /// Removes everything this tool may have left behind. Idempotent.
    fn cleanup(&self, target: &str) -> HavocResult<CleanupOutcome>;
}
