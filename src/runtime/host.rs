//! Host remote backend: typed kubectl + psql adapter.
//!
//! Every operation is one narrow, typed invocation (JSON output from
//! kubectl, tuple output from psql); no human-oriented text is grepped.
//! Database sessions are tagged with a havoc application_name so they can be
//! found and terminated later. Each call is bounded by the client's own
//! timeout; the engine adds none.

use std::process::{Command, Stdio};
use std::time::Duration;

use crate::{
    CleanupOutcome, Config, ConstraintKind, ConstraintSpec, HavocError, HavocResult, LockSnapshot,
    PendingUnit, RemoteExecutor, RemoteHandle, StateSnapshot, TaskKind, TaskStatus,
};

#[derive(Debug, Clone)]
pub struct HostRemote {
    kubectl: String,
    psql: String,
    namespace: String,
    db_user: String,
    lock_id: i64,
}

impl HostRemote {
    pub fn new(config: &Config, namespace: &str) -> Self {
        Self {
            kubectl: config.kubectl_path.clone(),
            psql: config.psql_path.clone(),
            namespace: namespace.to_string(),
            db_user: config.db_user.clone(),
            lock_id: config.advisory_lock_id,
        }
    }

    fn quota_name(target: &str) -> String {
        format!("havoc-{target}")
    }

    fn kubectl(&self, args: &[&str]) -> HavocResult<String> {
        let out = Command::new(&self.kubectl)
            .args(args)
            .output()
            .map_err(|err| HavocError::RemoteExecution(format!("kubectl: {err}")))?;
        if !out.status.success() {
            return Err(HavocError::RemoteExecution(format!(
                "kubectl {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Existence-style call: success means present, a clean failure means
    /// absent.
    fn kubectl_present(&self, args: &[&str]) -> HavocResult<bool> {
        let out = Command::new(&self.kubectl)
            .args(args)
            .output()
            .map_err(|err| HavocError::RemoteExecution(format!("kubectl: {err}")))?;
        Ok(out.status.success())
    }

    fn kubectl_json(&self, args: &[&str]) -> HavocResult<serde_json::Value> {
        let stdout = self.kubectl(args)?;
        serde_json::from_str(&stdout)
            .map_err(|err| HavocError::RemoteExecution(format!("kubectl json output: {err}")))
    }

    /// Unaligned tuple output, one row per line.
    fn psql_rows(&self, database: Option<&str>, sql: &str) -> HavocResult<Vec<String>> {
        let mut cmd = Command::new(&self.psql);
        cmd.args(["-X", "-A", "-t", "-U", &self.db_user, "-c", sql]);
        if let Some(db) = database {
            cmd.args(["-d", db]);
        }
        let out = cmd
            .output()
            .map_err(|err| HavocError::RemoteExecution(format!("psql: {err}")))?;
        if !out.status.success() {
            return Err(HavocError::RemoteExecution(format!(
                "psql: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Detached psql session running `sql`, tagged so it survives this
    /// process and remains addressable via pg_stat_activity.
    fn spawn_tagged_session(&self, tag: &str, sql: &str) -> HavocResult<()> {
        Command::new(&self.psql)
            .args(["-X", "-U", &self.db_user, "-c", sql])
            .env("PGAPPNAME", tag)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| HavocError::RemoteExecution(format!("psql spawn: {err}")))?;
        Ok(())
    }

    fn advisory_lock_held(&self) -> HavocResult<bool> {
        let rows = self.psql_rows(
            None,
            &format!(
                "select count(*) from pg_locks where locktype = 'advisory' and objid = {}",
                self.lock_id
            ),
        )?;
        Ok(rows.first().is_some_and(|n| n != "0"))
    }

    fn session_alive(&self, tag: &str) -> HavocResult<bool> {
        let rows = self.psql_rows(
            None,
            &format!("select count(*) from pg_stat_activity where application_name = '{tag}'"),
        )?;
        Ok(rows.first().is_some_and(|n| n != "0"))
    }

    fn deployment_replicas(&self, target: &str) -> HavocResult<(u32, u32)> {
        let v = self.kubectl_json(&[
            "-n",
            &self.namespace,
            "get",
            "deployment",
            target,
            "-o",
            "json",
        ])?;
        let desired = v["spec"]["replicas"].as_u64().unwrap_or(0) as u32;
        let current = v["status"]["availableReplicas"].as_u64().unwrap_or(0) as u32;
        Ok((desired, current))
    }
}

/// Re-runs `probe` until it reports true, up to `attempts` tries spaced by
/// `delay`. Ok(false) means the condition never appeared.
fn poll_until(
    attempts: u32,
    delay: Duration,
    mut probe: impl FnMut() -> HavocResult<bool>,
) -> HavocResult<bool> {
    for attempt in 0..attempts {
        if probe()? {
            return Ok(true);
        }
        if attempt + 1 < attempts {
            std::thread::sleep(delay);
        }
    }
    Ok(false)
}

impl RemoteExecutor for HostRemote {
    fn check_connectivity(&self) -> HavocResult<()> {
        self.kubectl(&["version", "--output=json"])?;
        self.psql_rows(None, "select 1")?;
        Ok(())
    }

    fn namespace_exists(&self, namespace: &str) -> HavocResult<bool> {
        self.kubectl_present(&["get", "namespace", namespace, "-o", "name"])
    }

    fn probe_resource(&self, id: &str) -> HavocResult<bool> {
        if self.kubectl_present(&["-n", &self.namespace, "get", "deployment", id, "-o", "name"])? {
            return Ok(true);
        }
        // Store-side candidate: walk every database looking for the relation.
        let databases =
            self.psql_rows(None, "select datname from pg_database where not datistemplate")?;
        for db in databases {
            let rows = self.psql_rows(
                Some(&db),
                &format!("select 1 from pg_class where relname = '{id}' limit 1"),
            )?;
            if !rows.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn list_by_selector(&self, selector: &str) -> HavocResult<Vec<String>> {
        let v = self.kubectl_json(&[
            "-n",
            &self.namespace,
            "get",
            "deployments",
            "-l",
            selector,
            "-o",
            "json",
        ])?;
        Ok(v["items"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|item| item["metadata"]["name"].as_str().map(str::to_string))
            .collect())
    }

    fn apply_constraint(&self, target: &str, spec: &ConstraintSpec) -> HavocResult<()> {
        let limit = spec.limit.unwrap_or(0);
        let quota = Self::quota_name(target);
        match spec.kind {
            ConstraintKind::Quota => {
                self.kubectl(&[
                    "-n",
                    &self.namespace,
                    "create",
                    "quota",
                    &quota,
                    &format!("--hard=pods={limit}"),
                ])?;
            }
            ConstraintKind::NodePressure => {
                self.kubectl(&[
                    "-n",
                    &self.namespace,
                    "create",
                    "quota",
                    &quota,
                    &format!("--hard=limits.cpu={limit}"),
                ])?;
            }
            ConstraintKind::LockContention => {
                return Err(HavocError::InvalidArgument(
                    "lock-contention constraints are dispatched as lock-holder tasks".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn verify_constraint(&self, target: &str) -> HavocResult<bool> {
        let quota = Self::quota_name(target);
        if self.kubectl_present(&["-n", &self.namespace, "get", "quota", &quota, "-o", "name"])? {
            return Ok(true);
        }
        let rows = self.psql_rows(
            None,
            &format!(
                "select count(*) from pg_locks where locktype = 'advisory' and objid = {}",
                self.lock_id
            ),
        )?;
        Ok(rows.first().is_some_and(|n| n != "0"))
    }

    fn relax_constraint(&self, target: &str) -> HavocResult<()> {
        let patch = serde_json::json!({"spec": {"hard": {}}}).to_string();
        self.kubectl(&[
            "-n",
            &self.namespace,
            "patch",
            "quota",
            &Self::quota_name(target),
            "--type=merge",
            "-p",
            &patch,
        ])?;
        Ok(())
    }

    fn remove_constraint(&self, target: &str) -> HavocResult<()> {
        self.kubectl(&[
            "-n",
            &self.namespace,
            "delete",
            "quota",
            &Self::quota_name(target),
        ])?;
        Ok(())
    }

    fn exec_background(
        &self,
        target: &str,
        kind: TaskKind,
        duration: Duration,
    ) -> HavocResult<RemoteHandle> {
        let secs = duration.as_secs().max(1);
        let tag = format!("havoc-{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        match kind {
            TaskKind::LockHolder => {
                // The hold loop runs server-side: the lock is taken when the
                // statement starts, pg_sleep keeps the session (and lock)
                // alive for the full window.
                self.spawn_tagged_session(
                    &tag,
                    &format!("select pg_advisory_lock({}), pg_sleep({secs})", self.lock_id),
                )?;
                // Dispatch returns only after the initial effect is applied:
                // the spawned session connects asynchronously, so wait for
                // the lock row to show up before the caller verifies it.
                let held = poll_until(50, Duration::from_millis(100), || {
                    self.advisory_lock_held()
                })?;
                if !held {
                    return Err(HavocError::RemoteExecution(format!(
                        "session {tag} did not acquire advisory lock {}",
                        self.lock_id
                    )));
                }
            }
            TaskKind::LoadGenerator => {
                let (desired, _) = self.deployment_replicas(target)?;
                self.kubectl(&[
                    "-n",
                    &self.namespace,
                    "scale",
                    "deployment",
                    target,
                    &format!("--replicas={}", desired.saturating_add(2)),
                ])?;
            }
            TaskKind::Sampler => {
                self.spawn_tagged_session(
                    &tag,
                    &format!(
                        "do $$ begin for i in 1..{} loop perform count(*) from pg_locks; \
                         perform pg_sleep(1); end loop; end $$",
                        secs
                    ),
                )?;
            }
        }
        Ok(RemoteHandle {
            session: tag,
            log_path: None,
        })
    }

    fn sample_state(&self, target: &str) -> HavocResult<StateSnapshot> {
        let (desired, current) = self.deployment_replicas(target)?;

        let pods = self.kubectl_json(&["-n", &self.namespace, "get", "pods", "-o", "json"])?;
        let mut pending = Vec::new();
        for pod in pods["items"].as_array().into_iter().flatten() {
            if pod["status"]["phase"].as_str() != Some("Pending") {
                continue;
            }
            let name = pod["metadata"]["name"].as_str().unwrap_or("?").to_string();
            let condition = pod["status"]["conditions"]
                .as_array()
                .and_then(|c| c.first())
                .and_then(|c| c["message"].as_str())
                .unwrap_or("pending")
                .to_string();
            pending.push(PendingUnit { name, condition });
        }

        let mut locks = Vec::new();
        let rows = self.psql_rows(
            None,
            "select a.application_name, l.granted from pg_locks l \
             join pg_stat_activity a on a.pid = l.pid where l.locktype = 'advisory'",
        )?;
        for row in rows {
            if let Some((session, granted)) = row.split_once('|') {
                locks.push(LockSnapshot {
                    resource: target.to_string(),
                    session: session.to_string(),
                    granted: granted == "t",
                });
            }
        }

        let events = self
            .kubectl_json(&[
                "-n",
                &self.namespace,
                "get",
                "events",
                "--sort-by=.lastTimestamp",
                "-o",
                "json",
            ])
            .map(|v| {
                v["items"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .rev()
                    .take(8)
                    .filter_map(|e| e["message"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(StateSnapshot {
            desired,
            current,
            pending,
            locks,
            events,
        })
    }

    fn task_status(&self, handle: &RemoteHandle) -> HavocResult<TaskStatus> {
        if !handle.session.starts_with("havoc-") {
            return Ok(TaskStatus::Unknown);
        }
        match self.session_alive(&handle.session) {
            Ok(true) => Ok(TaskStatus::Dispatched),
            Ok(false) => Ok(TaskStatus::ConfirmedEnded),
            Err(_) => Ok(TaskStatus::Unknown),
        }
    }

    fn terminate_session(&self, session: &str) -> HavocResult<()> {
        let rows = self.psql_rows(
            None,
            &format!(
                "select pg_terminate_backend(pid) from pg_stat_activity \
                 where application_name = '{session}'"
            ),
        )?;
        if rows.is_empty() {
            return Err(HavocError::RemoteExecution(format!("unknown session {session}")));
        }
        Ok(())
    }

    fn cleanup(&self, target: &str) -> HavocResult<CleanupOutcome> {
        let mut removed = 0usize;
        let quota = Self::quota_name(target);
        if self.kubectl_present(&["-n", &self.namespace, "get", "quota", &quota, "-o", "name"])? {
            self.kubectl(&["-n", &self.namespace, "delete", "quota", &quota])?;
            removed += 1;
        }
        let rows = self.psql_rows(
            None,
            "select pg_terminate_backend(pid) from pg_stat_activity \
             where application_name like 'havoc-%'",
        )?;
        removed += rows.len();
        Ok(CleanupOutcome { removed })
    }
}
