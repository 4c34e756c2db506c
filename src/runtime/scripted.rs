//! Scripted remote backend: a deterministic in-memory target.
//!
//! Simulates a namespace of workloads plus an attached store with databases
//! and tables. Shares the engine clock, so background-task expiry follows
//! virtual time in rehearsal runs and tests. All tests drive the engine
//! through this backend.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    CleanupOutcome, ConstraintKind, ConstraintSpec, EngineClock, HavocError, HavocResult,
    LockSnapshot, PendingUnit, RemoteExecutor, RemoteHandle, ScenarioDefinition, StateSnapshot,
    TargetSpec, TaskKind, TaskStatus,
};

#[derive(Debug, Clone)]
struct ScriptedResource {
    desired: u32,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct ScriptedSession {
    kind: TaskKind,
    target: String,
    ends_at_ms: u64,
    ended: bool,
}

#[derive(Debug, Default)]
struct ScriptedState {
    offline: bool,
    fail_apply: bool,
    namespaces: BTreeSet<String>,
    resources: BTreeMap<String, ScriptedResource>,
    /// database name -> tables; candidate probes enumerate these.
    databases: BTreeMap<String, BTreeSet<String>>,
    constraints: BTreeMap<String, ConstraintSpec>,
    sessions: BTreeMap<u64, ScriptedSession>,
    events: VecDeque<String>,
    next_session: u64,
}

#[derive(Debug)]
pub struct ScriptedRemote {
    clock: Arc<EngineClock>,
    state: Mutex<ScriptedState>,
    probes: AtomicU64,
}

impl ScriptedRemote {
    pub fn new(clock: Arc<EngineClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ScriptedState {
                next_session: 1,
                ..ScriptedState::default()
            }),
            probes: AtomicU64::new(0),
        }
    }

    /// Seeds a target good enough to rehearse `scenario` end to end: the
    /// namespace exists and the last candidate (or the explicit/selector
    /// target) resolves, so candidate probing is actually exercised.
    pub fn rehearsal(clock: Arc<EngineClock>, scenario: &ScenarioDefinition) -> Self {
        let remote = Self::new(clock);
        remote.add_namespace(&scenario.system);
        match &scenario.target {
            TargetSpec::Explicit(id) => {
                remote.add_resource(id, scenario.desired_capacity, &[]);
            }
            TargetSpec::Selector(selector) => {
                let labels: Vec<(&str, &str)> = selector
                    .split_once('=')
                    .map(|(k, v)| vec![(k, v)])
                    .unwrap_or_default();
                remote.add_resource(&format!("{}-0", scenario.name), scenario.desired_capacity, &labels);
            }
            TargetSpec::Candidates(list) => {
                if let Some(last) = list.last() {
                    remote.add_resource(last, scenario.desired_capacity, &[]);
                }
            }
        }
        remote
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.state.lock().unwrap().namespaces.insert(namespace.to_string());
    }

    pub fn add_resource(&self, name: &str, desired: u32, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(name.to_string(), ScriptedResource { desired, labels });
    }

    pub fn add_table(&self, database: &str, table: &str) {
        self.state
            .lock()
            .unwrap()
            .databases
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_fail_apply(&self, fail: bool) {
        self.state.lock().unwrap().fail_apply = fail;
    }

    /// Number of existence probes issued so far.
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Active (not ended) sessions of `kind`, for liveness assertions.
    pub fn active_sessions(&self, kind: TaskKind) -> usize {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);
        state
            .sessions
            .values()
            .filter(|s| !s.ended && s.kind == kind)
            .count()
    }

    fn push_event(state: &mut ScriptedState, event: String) {
        state.events.push_back(event);
        while state.events.len() > 8 {
            state.events.pop_front();
        }
    }

    fn ensure_online(state: &ScriptedState) -> HavocResult<()> {
        if state.offline {
            return Err(HavocError::RemoteExecution("scripted target offline".to_string()));
        }
        Ok(())
    }
}

fn expire_sessions(state: &mut ScriptedState, now_ms: u64) {
    for session in state.sessions.values_mut() {
        if !session.ended && now_ms >= session.ends_at_ms {
            session.ended = true;
        }
    }
}

fn condition_for(kind: ConstraintKind) -> &'static str {
    match kind {
        ConstraintKind::Quota => "quota-exhausted: exceeded namespace quota",
        ConstraintKind::NodePressure => "insufficient-resource: no schedulable node capacity",
        ConstraintKind::LockContention => "lock-contention: blocked on advisory lock",
    }
}

impl RemoteExecutor for ScriptedRemote {
    fn check_connectivity(&self) -> HavocResult<()> {
        let state = self.state.lock().unwrap();
        Self::ensure_online(&state)
    }

    fn namespace_exists(&self, namespace: &str) -> HavocResult<bool> {
        let state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        Ok(state.namespaces.contains(namespace))
    }

    fn probe_resource(&self, id: &str) -> HavocResult<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        if state.resources.contains_key(id) {
            return Ok(true);
        }
        // Store-side candidates: walk every database before giving up.
        Ok(state.databases.values().any(|tables| tables.contains(id)))
    }

    fn list_by_selector(&self, selector: &str) -> HavocResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let (key, value) = selector.split_once('=').ok_or_else(|| {
            HavocError::InvalidArgument(format!("invalid selector {selector:?} (expected key=value)"))
        })?;
        Ok(state
            .resources
            .iter()
            .filter(|(_, r)| r.labels.get(key).is_some_and(|v| v == value))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn apply_constraint(&self, target: &str, spec: &ConstraintSpec) -> HavocResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        if state.fail_apply {
            return Err(HavocError::RemoteExecution(format!(
                "constraint rejected by target for {target}"
            )));
        }
        if !state.resources.contains_key(target) {
            return Err(HavocError::RemoteExecution(format!("unknown resource {target}")));
        }
        state.constraints.insert(target.to_string(), spec.clone());
        Self::push_event(&mut state, format!("applied {:?} constraint to {target}", spec.kind));
        Ok(())
    }

    fn verify_constraint(&self, target: &str) -> HavocResult<bool> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);
        if state.constraints.contains_key(target) {
            return Ok(true);
        }
        Ok(state
            .sessions
            .values()
            .any(|s| !s.ended && s.kind == TaskKind::LockHolder && s.target == target))
    }

    fn relax_constraint(&self, target: &str) -> HavocResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let relaxed = state
            .constraints
            .get_mut(target)
            .map(|spec| spec.limit = None)
            .is_some();
        if !relaxed {
            return Err(HavocError::RemoteExecution(format!(
                "no constraint present on {target}"
            )));
        }
        Self::push_event(&mut state, format!("relaxed constraint on {target}"));
        Ok(())
    }

    fn remove_constraint(&self, target: &str) -> HavocResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        if state.constraints.remove(target).is_none() {
            return Err(HavocError::RemoteExecution(format!(
                "no constraint present on {target}"
            )));
        }
        Self::push_event(&mut state, format!("removed constraint from {target}"));
        Ok(())
    }

    fn exec_background(
        &self,
        target: &str,
        kind: TaskKind,
        duration: Duration,
    ) -> HavocResult<RemoteHandle> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);

        let id = state.next_session;
        state.next_session += 1;
        let ends_at_ms = now.saturating_add(duration.as_millis().min(u128::from(u64::MAX)) as u64);
        state.sessions.insert(
            id,
            ScriptedSession {
                kind,
                target: target.to_string(),
                ends_at_ms,
                ended: false,
            },
        );
        Self::push_event(&mut state, format!("dispatched {} against {target}", kind.as_str()));
        Ok(RemoteHandle {
            session: format!("scripted-{id}"),
            log_path: Some(format!("/var/log/havoc/{}-{id}.log", kind.as_str())),
        })
    }

    fn sample_state(&self, target: &str) -> HavocResult<StateSnapshot> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);

        let resource = state
            .resources
            .get(target)
            .ok_or_else(|| HavocError::RemoteExecution(format!("unknown resource {target}")))?;
        let desired = resource.desired;
        let mut current = desired;
        let mut pending = Vec::new();

        if let Some(spec) = state.constraints.get(target)
            && let Some(limit) = spec.limit
            && limit < desired
        {
            current = limit;
            for i in limit..desired {
                pending.push(PendingUnit {
                    name: format!("{target}-{i}"),
                    condition: condition_for(spec.kind).to_string(),
                });
            }
        }

        let mut locks = Vec::new();
        for (id, session) in &state.sessions {
            if !session.ended && session.kind == TaskKind::LockHolder && session.target == target {
                locks.push(LockSnapshot {
                    resource: target.to_string(),
                    session: format!("scripted-{id}"),
                    granted: true,
                });
            }
        }
        if !locks.is_empty() {
            // A held lock wedges one worker and leaves its transaction pending.
            current = current.saturating_sub(1);
            pending.push(PendingUnit {
                name: format!("{target}-txn"),
                condition: condition_for(ConstraintKind::LockContention).to_string(),
            });
        }

        Ok(StateSnapshot {
            desired,
            current,
            pending,
            locks,
            events: state.events.iter().cloned().collect(),
        })
    }

    fn task_status(&self, handle: &RemoteHandle) -> HavocResult<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);
        let id = match handle.session.strip_prefix("scripted-").and_then(|s| s.parse::<u64>().ok()) {
            Some(id) => id,
            None => return Ok(TaskStatus::Unknown),
        };
        match state.sessions.get(&id) {
            Some(session) if session.ended => Ok(TaskStatus::ConfirmedEnded),
            Some(_) => Ok(TaskStatus::Dispatched),
            None => Ok(TaskStatus::Unknown),
        }
    }

    fn terminate_session(&self, session: &str) -> HavocResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let id = session
            .strip_prefix("scripted-")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| HavocError::RemoteExecution(format!("unknown session {session}")))?;
        let terminated = state
            .sessions
            .get_mut(&id)
            .map(|entry| entry.ended = true)
            .is_some();
        if !terminated {
            return Err(HavocError::RemoteExecution(format!("unknown session {session}")));
        }
        Self::push_event(&mut state, format!("terminated session {session}"));
        Ok(())
    }

    fn cleanup(&self, target: &str) -> HavocResult<CleanupOutcome> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_online(&state)?;
        let now = self.clock.now_ms();
        expire_sessions(&mut state, now);

        let mut removed = 0usize;
        if state.constraints.remove(target).is_some() {
            removed += 1;
        }
        for session in state.sessions.values_mut() {
            if !session.ended && session.target == target {
                session.ended = true;
                removed += 1;
            }
        }
        if removed > 0 {
            Self::push_event(&mut state, format!("cleaned up {removed} leftover(s) on {target}"));
        }
        Ok(CleanupOutcome { removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClockMode;

    fn scripted() -> (Arc<EngineClock>, ScriptedRemote) {
        let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
        let remote = ScriptedRemote::new(Arc::clone(&clock));
        remote.add_namespace("chaos-lab");
        remote.add_resource("orders", 5, &[("app", "orders")]);
        (clock, remote)
    }

    #[test]
    fn lock_sessions_expire_with_the_clock() {
        let (clock, remote) = scripted();
        let handle = remote
            .exec_background("orders", TaskKind::LockHolder, Duration::from_secs(30))
            .unwrap();
        assert_eq!(remote.task_status(&handle).unwrap(), TaskStatus::Dispatched);

        clock.advance(Duration::from_secs(29));
        assert_eq!(remote.task_status(&handle).unwrap(), TaskStatus::Dispatched);

        clock.advance(Duration::from_secs(1));
        assert_eq!(remote.task_status(&handle).unwrap(), TaskStatus::ConfirmedEnded);
        assert!(remote.sample_state("orders").unwrap().locks.is_empty());
    }

    #[test]
    fn quota_constraint_caps_capacity_and_leaves_pending_units() {
        let (_clock, remote) = scripted();
        remote
            .apply_constraint(
                "orders",
                &ConstraintSpec {
                    kind: ConstraintKind::Quota,
                    limit: Some(2),
                },
            )
            .unwrap();
        let snapshot = remote.sample_state("orders").unwrap();
        assert_eq!(snapshot.desired, 5);
        assert_eq!(snapshot.current, 2);
        assert_eq!(snapshot.pending.len(), 3);
        assert!(snapshot.pending[0].condition.contains("quota-exhausted"));
    }

    #[test]
    fn terminate_releases_the_lock() {
        let (_clock, remote) = scripted();
        let handle = remote
            .exec_background("orders", TaskKind::LockHolder, Duration::from_secs(300))
            .unwrap();
        assert_eq!(remote.sample_state("orders").unwrap().locks.len(), 1);
        remote.terminate_session(&handle.session).unwrap();
        assert!(remote.sample_state("orders").unwrap().locks.is_empty());
        assert!(remote.terminate_session("scripted-999").is_err());
    }

    #[test]
    fn selector_matches_labels_in_listing_order() {
        let (_clock, remote) = scripted();
        remote.add_resource("orders-canary", 1, &[("app", "orders")]);
        let names = remote.list_by_selector("app=orders").unwrap();
        assert_eq!(names, vec!["orders".to_string(), "orders-canary".to_string()]);
        assert!(remote.list_by_selector("garbage").is_err());
    }
}
