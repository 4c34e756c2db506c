//! End-to-end engine flows against the scripted backend with virtual time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use havoc::{
    ActionLog, ClockMode, Config, ConfirmationPolicy, ConstraintKind, ConstraintSpec, EngineClock,
    HavocError, RemediationStrategy, RemoteExecutor, Report, RunManifest, RunMode, RunOptions,
    RunStatus, ScenarioDefinition, ScenarioFile, ScriptedRemote, TargetSpec, Verdict, remediate,
    run_scenario,
};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("havoc-flow-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn config_in(ws: &PathBuf) -> Config {
    Config {
        base_dir: ws.join(".havoc"),
        clock: ClockMode::Virtual,
        ..Config::default()
    }
}

fn quota_scenario() -> ScenarioDefinition {
    let file = ScenarioFile {
        version: 1,
        name: "quota-starvation".to_string(),
        system: "chaos-lab".to_string(),
        target: TargetSpec::Candidates(vec!["missing".to_string(), "orders-api".to_string()]),
        constraint: ConstraintSpec {
            kind: ConstraintKind::Quota,
            limit: Some(2),
        },
        signature: vec!["quota".to_string()],
        duration: Some("60s".to_string()),
        sample_interval: Some("10s".to_string()),
        grace_period: Some("10s".to_string()),
        desired_capacity: Some(5),
        phases: None,
    };
    ScenarioDefinition::from_file(file, &Config::default()).expect("scenario")
}

fn scripted_target(clock: &Arc<EngineClock>) -> ScriptedRemote {
    let remote = ScriptedRemote::new(Arc::clone(clock));
    remote.add_namespace("chaos-lab");
    remote.add_resource("orders-api", 5, &[("app", "orders")]);
    remote
}

fn read_report(summary_path: &str) -> Report {
    let bytes = std::fs::read(summary_path).expect("read report");
    serde_json::from_slice(&bytes).expect("parse report")
}

fn read_manifest(run_dir: &std::path::Path) -> RunManifest {
    let bytes = std::fs::read(run_dir.join("manifest.json")).expect("read manifest");
    serde_json::from_slice(&bytes).expect("parse manifest")
}

/// The single run directory under `runs/`, for tests that abort before a
/// summary (and its paths) exists.
fn only_run_dir(cfg: &Config) -> PathBuf {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(cfg.runs_dir())
        .expect("read runs dir")
        .map(|e| e.expect("dir entry").path())
        .collect();
    assert_eq!(dirs.len(), 1, "expected exactly one run directory");
    dirs.pop().expect("run dir")
}

#[test]
fn quota_run_verifies_failure_signature() {
    let ws = temp_workspace("quota");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let run = run_scenario(&cfg, &scenario, &remote, Arc::clone(&clock), &RunOptions::default())
        .expect("run");
    let summary = run.summary;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.verdict, Some(Verdict::Verified));
    assert!(!summary.partial);
    // ceil(60/10) + 1: one sample per interval plus the grace sample.
    assert_eq!(summary.sample_count, 7);

    let report = read_report(summary.report_path.as_deref().expect("report path"));
    assert_eq!(report.samples.len(), 7);
    assert!(
        report
            .samples
            .windows(2)
            .all(|w| w[0].timestamp_ms < w[1].timestamp_ms),
        "samples must be strictly timestamp-increasing"
    );
    assert!(report.samples.iter().all(|s| s.desired == 5 && s.current == 2));

    let actions =
        std::fs::read_to_string(summary.actions_path.as_deref().expect("actions path")).unwrap();
    assert!(actions.contains("resolved target orders-api"));
    assert!(actions.contains("deployed Quota constraint"));

    // The run directory is indexed by a manifest alongside the report.
    let manifest = read_manifest(&only_run_dir(&cfg));
    assert_eq!(manifest.run_id, summary.run_id);
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.verdict, Some(Verdict::Verified));
    assert_eq!(manifest.sample_count, 7);
}

#[test]
fn monitor_only_on_healthy_target_is_not_observed() {
    let ws = temp_workspace("monitor");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let opt = RunOptions {
        mode: RunMode::MonitorOnly,
        ..RunOptions::default()
    };
    let run = run_scenario(&cfg, &scenario, &remote, clock, &opt).expect("run");

    assert_eq!(run.summary.status, RunStatus::Completed);
    assert_eq!(run.summary.verdict, Some(Verdict::NotObserved));
    // Nothing was deployed, so there is nothing to clean up either.
    assert_eq!(remote.cleanup("orders-api").unwrap().removed, 0);
}

#[test]
fn explicit_target_override_skips_discovery() {
    let ws = temp_workspace("explicit");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let opt = RunOptions {
        target: Some("orders-api".to_string()),
        ..RunOptions::default()
    };
    let run = run_scenario(&cfg, &scenario, &remote, clock, &opt).expect("run");

    assert_eq!(run.summary.target, "orders-api");
    assert_eq!(remote.probes(), 0, "explicit id must not invoke the probing path");
}

#[test]
fn missing_namespace_fails_prerequisites_before_any_mutation() {
    let ws = temp_workspace("prereq");
    let cfg = config_in(&ws);
    let mut scenario = quota_scenario();
    scenario.system = "nonexistent".to_string();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let err = run_scenario(&cfg, &scenario, &remote, clock, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, HavocError::Prerequisite(_)));
    assert!(remote.sample_state("orders-api").unwrap().pending.is_empty());
}

#[test]
fn unresolvable_candidates_are_not_found() {
    let ws = temp_workspace("notfound");
    let cfg = config_in(&ws);
    let mut scenario = quota_scenario();
    scenario.target = TargetSpec::Candidates(vec!["a".to_string(), "b".to_string()]);
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let err = run_scenario(&cfg, &scenario, &remote, clock, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, HavocError::NotFound(_)));

    // Resolution is mandatory, but its abort still leaves the full
    // artifact set behind: empty partial report plus manifest.
    let run_dir = only_run_dir(&cfg);
    let report = read_report(run_dir.join("report.json").to_str().unwrap());
    assert!(report.partial);
    assert!(report.samples.is_empty());
    assert!(report.verdict.is_none());
    let manifest = read_manifest(&run_dir);
    assert_eq!(manifest.status, RunStatus::Aborted);
    assert_eq!(manifest.sample_count, 0);
    let actions = std::fs::read_to_string(run_dir.join("actions.log")).unwrap();
    assert!(actions.contains("target resolution failed, aborting run"));
}

#[test]
fn deploy_hard_failure_still_writes_a_partial_report() {
    let ws = temp_workspace("hardfail");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);
    remote.set_fail_apply(true);

    let run = run_scenario(&cfg, &scenario, &remote, clock, &RunOptions::default()).expect("run");
    let summary = run.summary;

    assert_eq!(summary.status, RunStatus::Aborted);
    assert!(summary.partial);
    assert_eq!(summary.verdict, None);
    assert_eq!(summary.sample_count, 0);

    let report = read_report(summary.report_path.as_deref().expect("report path"));
    assert!(report.partial, "aborted run must be labeled partial");
    assert!(report.samples.is_empty());
    assert_eq!(read_manifest(&only_run_dir(&cfg)).status, RunStatus::Aborted);
}

#[test]
fn zero_duration_run_collects_at_most_one_sample() {
    let ws = temp_workspace("zero");
    let cfg = config_in(&ws);
    let mut scenario = quota_scenario();
    scenario.duration = Duration::ZERO;
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let run = run_scenario(&cfg, &scenario, &remote, clock, &RunOptions::default()).expect("run");
    assert_eq!(run.summary.status, RunStatus::Completed);
    assert!(run.summary.sample_count <= 1);
}

#[test]
fn lock_scenario_verifies_and_grace_captures_the_release() {
    let ws = temp_workspace("lock");
    let cfg = config_in(&ws);
    let mut scenario = quota_scenario();
    scenario.constraint = ConstraintSpec {
        kind: ConstraintKind::LockContention,
        limit: None,
    };
    scenario.signature = vec!["lock-contention".to_string()];
    scenario.duration = Duration::from_secs(40);
    scenario.grace_period = Duration::from_secs(10);
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let run = run_scenario(&cfg, &scenario, &remote, Arc::clone(&clock), &RunOptions::default())
        .expect("run");
    assert_eq!(run.summary.verdict, Some(Verdict::Verified));

    // The hold loop expired remotely; the grace sample sees the release.
    let report = read_report(run.summary.report_path.as_deref().expect("report path"));
    let last = report.samples.last().expect("samples");
    assert!(last.locks.is_empty());
    assert_eq!(last.desired, last.current);
    // The engine never terminated the session; it ended on its own.
    let actions =
        std::fs::read_to_string(run.summary.actions_path.as_deref().unwrap()).unwrap();
    assert!(!actions.contains("terminated session"));
}

#[test]
fn monitor_log_reports_the_actual_sampled_span() {
    let ws = temp_workspace("span");
    let cfg = config_in(&ws);
    let mut scenario = quota_scenario();
    // Grace shorter than the interval: the loop still runs
    // ceil(60/10) + 1 = 7 ticks, 70s of sampled span.
    scenario.grace_period = Duration::from_secs(5);
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);

    let run = run_scenario(&cfg, &scenario, &remote, clock, &RunOptions::default()).expect("run");
    let actions =
        std::fs::read_to_string(run.summary.actions_path.as_deref().unwrap()).unwrap();
    assert!(
        actions.contains("monitored orders-api for 70s (7 sample(s), 0 missed)"),
        "action log must state the sampled span, not the grace window"
    );
}

#[test]
fn cleanup_mode_is_idempotent() {
    let ws = temp_workspace("cleanup");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);
    remote
        .apply_constraint(
            "orders-api",
            &ConstraintSpec {
                kind: ConstraintKind::Quota,
                limit: Some(2),
            },
        )
        .unwrap();

    let opt = RunOptions {
        mode: RunMode::Cleanup,
        ..RunOptions::default()
    };
    let first = run_scenario(&cfg, &scenario, &remote, Arc::clone(&clock), &opt).expect("first");
    let second = run_scenario(&cfg, &scenario, &remote, clock, &opt).expect("second");

    assert_eq!(first.summary.status, RunStatus::Completed);
    assert_eq!(second.summary.status, RunStatus::Completed);
    let second_actions =
        std::fs::read_to_string(second.summary.actions_path.as_deref().unwrap()).unwrap();
    assert!(
        second_actions.contains("cleanup removed 0 leftover(s)"),
        "second cleanup must find nothing to remove"
    );
    assert!(remote.sample_state("orders-api").unwrap().pending.is_empty());
}

#[test]
fn declined_confirmation_cancels_remediation_without_mutation() {
    let ws = temp_workspace("declined");
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);
    remote
        .apply_constraint(
            "orders-api",
            &ConstraintSpec {
                kind: ConstraintKind::Quota,
                limit: Some(2),
            },
        )
        .unwrap();

    let actions = ActionLog::create(&ws).expect("action log");
    let mut policy = ConfirmationPolicy::PromptUser(Box::new(|_| Ok(false)));
    let err = remediate(
        &remote,
        "orders-api",
        RemediationStrategy::RemoveConstraint,
        &mut policy,
        &actions,
    )
    .unwrap_err();

    assert!(matches!(err, HavocError::UserCancelled));
    assert!(remote.verify_constraint("orders-api").unwrap(), "no mutation on decline");
}

#[test]
fn remediation_removes_the_constraint_and_reverifies_once() {
    let ws = temp_workspace("remediate");
    let cfg = config_in(&ws);
    let scenario = quota_scenario();
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);
    remote
        .apply_constraint(
            "orders-api",
            &ConstraintSpec {
                kind: ConstraintKind::Quota,
                limit: Some(2),
            },
        )
        .unwrap();

    let opt = RunOptions {
        mode: RunMode::Remediate,
        strategy: Some(RemediationStrategy::RemoveConstraint),
        unattended: true,
        ..RunOptions::default()
    };
    let run = run_scenario(&cfg, &scenario, &remote, clock, &opt).expect("run");

    assert_eq!(run.summary.status, RunStatus::Completed);
    assert!(!remote.verify_constraint("orders-api").unwrap());
    let snapshot = remote.sample_state("orders-api").unwrap();
    assert_eq!(snapshot.desired, snapshot.current);
    // The post-remediation state lands in the report as its one sample.
    assert_eq!(run.summary.sample_count, 1);
}

#[test]
fn terminate_session_remediation_releases_a_held_lock() {
    let ws = temp_workspace("terminate");
    let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
    let remote = scripted_target(&clock);
    remote
        .exec_background(
            "orders-api",
            havoc::TaskKind::LockHolder,
            Duration::from_secs(600),
        )
        .unwrap();
    assert_eq!(remote.sample_state("orders-api").unwrap().locks.len(), 1);

    let actions = ActionLog::create(&ws).expect("action log");
    let mut policy = ConfirmationPolicy::AutoApprove;
    let outcome = remediate(
        &remote,
        "orders-api",
        RemediationStrategy::TerminateSession,
        &mut policy,
        &actions,
    )
    .expect("remediate");

    assert!(outcome.constraint_cleared);
    assert!(remote.sample_state("orders-api").unwrap().locks.is_empty());
}
