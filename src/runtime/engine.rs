//! Phase executor: the sequential state machine driving one scenario run.
//!
//! The orchestrating process is single-threaded; concurrency comes from
//! fire-and-forget remote tasks with verifiable handles, never from awaited
//! futures. LoadGenerate and the sampler dispatched in Monitor are
//! deliberately not awaited: degradation must be observed while the
//! injected condition is active.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    ActionLog, Config, ConfirmationPolicy, ConstraintKind, EngineClock, HavocError, HavocResult,
    PhaseAction, PhaseSpec, RemediationStrategy, RemoteExecutor, ReportBuilder, ResourceLocator,
    RunStatus, RunSummary, Sample, ScenarioDefinition, StateSnapshot, TargetSpec, TaskKind,
    TaskManager, Verdict, analyzer, remediate, wall_time_iso_utc, write_report,
    write_run_manifest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DeployAndMonitor,
    MonitorOnly,
    Remediate,
    Cleanup,
}

#[derive(Debug)]
pub struct RunOptions {
    pub mode: RunMode,
    /// CLI target override; trumps the scenario's target spec.
    pub target: Option<String>,
    pub selector: Option<String>,
    pub duration: Option<Duration>,
    pub sample_interval: Option<Duration>,
    pub strategy: Option<RemediationStrategy>,
    pub unattended: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::DeployAndMonitor,
            target: None,
            selector: None,
            duration: None,
            sample_interval: None,
            strategy: None,
            unattended: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Init,
    PrereqOk,
    Deploy,
    Verify,
    LoadGenerate,
    Monitor,
    Analyze,
    Report,
    RemediateRequested,
    Remediate,
    Cleanup,
    Done,
}

#[derive(Debug, Clone)]
enum PhaseOutcome {
    Succeed,
    SoftFail(String),
    HardFail(String),
}

/// Per-run mutable state. Created after the scenario is loaded, discarded
/// at run end. The resolved target is immutable once the locator succeeds.
struct ExecutionContext<'a> {
    run_id: String,
    scenario: &'a ScenarioDefinition,
    clock: Arc<EngineClock>,
    target: String,
    duration: Duration,
    sample_interval: Duration,
    tasks: TaskManager,
    report: ReportBuilder,
    actions: ActionLog,
    degraded: Vec<String>,
    state: PhaseState,
}

/// Scaffolds a havoc project: config file, artifacts directory, and one
/// example scenario.
pub fn init_project(config: &Config, force: bool) -> HavocResult<()> {
    let base = &config.base_dir;
    if base.exists() && !force {
        return Err(HavocError::InvalidArgument(format!(
            "{} already exists (use --force to overwrite)",
            base.display()
        )));
    }
    std::fs::create_dir_all(config.runs_dir())?;

    let config_path = PathBuf::from("havoc.toml");
    if force || !config_path.exists() {
        let cfg = toml::to_string_pretty(config).map_err(|e| HavocError::Config(e.to_string()))?;
        std::fs::write(&config_path, cfg)?;
    }

    std::fs::create_dir_all("scenarios")?;
    let scenario_path = PathBuf::from("scenarios").join("example.havoc.json");
    if force || !scenario_path.exists() {
        let example = ScenarioDefinition::example();
        std::fs::write(&scenario_path, serde_json::to_vec_pretty(&example)?)?;
    }
    Ok(())
}

/// Non-retried connectivity + namespace check. Nothing mutates before this
/// passes.
pub fn check_prerequisites(remote: &dyn RemoteExecutor, namespace: &str) -> HavocResult<()> {
    remote
        .check_connectivity()
        .map_err(|err| HavocError::Prerequisite(format!("target unreachable: {err}")))?;
    match remote.namespace_exists(namespace) {
        Ok(true) => Ok(()),
        Ok(false) => Err(HavocError::Prerequisite(format!(
            "namespace {namespace} does not exist"
        ))),
        Err(err) => Err(HavocError::Prerequisite(format!(
            "namespace check failed: {err}"
        ))),
    }
}

fn default_phases(mode: RunMode) -> Vec<PhaseSpec> {
    let phase = |name: &str, action: PhaseAction, mandatory: bool| PhaseSpec {
        name: name.to_string(),
        action,
        timeout: None,
        mandatory,
    };
    match mode {
        RunMode::DeployAndMonitor => vec![
            phase("deploy", PhaseAction::Deploy, true),
            phase("verify", PhaseAction::Verify, true),
            phase("load", PhaseAction::Load, false),
            phase("monitor", PhaseAction::Monitor, false),
            phase("analyze", PhaseAction::Analyze, false),
            phase("report", PhaseAction::Report, false),
            phase("cleanup", PhaseAction::Cleanup, false),
        ],
        RunMode::MonitorOnly => vec![
            phase("monitor", PhaseAction::Monitor, false),
            phase("analyze", PhaseAction::Analyze, false),
            phase("report", PhaseAction::Report, false),
        ],
        // Remediate/cleanup modes bypass the phase list entirely.
        RunMode::Remediate | RunMode::Cleanup => Vec::new(),
    }
}

fn state_for(action: PhaseAction) -> PhaseState {
    match action {
        PhaseAction::Deploy => PhaseState::Deploy,
        PhaseAction::Verify => PhaseState::Verify,
        PhaseAction::Load => PhaseState::LoadGenerate,
        PhaseAction::Monitor => PhaseState::Monitor,
        PhaseAction::Analyze => PhaseState::Analyze,
        PhaseAction::Report => PhaseState::Report,
        PhaseAction::Remediate => PhaseState::Remediate,
        PhaseAction::Cleanup => PhaseState::Cleanup,
    }
}

/// Drives one scenario run end to end and always attempts a final report,
/// abort included.
pub fn run_scenario(
    config: &Config,
    scenario: &ScenarioDefinition,
    remote: &dyn RemoteExecutor,
    clock: Arc<EngineClock>,
    opt: &RunOptions,
) -> HavocResult<RunResult> {
    let run_id = Uuid::new_v4().to_string();
    let artifacts_dir = config.runs_dir().join(&run_id);
    let actions = ActionLog::create(&artifacts_dir)?;
    let started_at = wall_time_iso_utc();
    let started = Instant::now();

    check_prerequisites(remote, &scenario.system)?;
    actions.record(&format!(
        "prerequisites ok (namespace {}, backend reachable)",
        scenario.system
    ));

    // Locator resolution happens-before any background dispatch. Resolution
    // is mandatory: a miss aborts the run, but the abort still leaves a
    // partial report and manifest behind before the error surfaces.
    let target_spec = effective_target_spec(scenario, opt);
    let mut locator = ResourceLocator::new();
    let target = match locator.resolve(remote, &target_spec) {
        Ok(target) => target,
        Err(err) => {
            actions.record(&format!("target resolution failed, aborting run: {err}"));
            if let Err(write_err) = write_abort_artifacts(
                &run_id,
                scenario,
                opt,
                &actions,
                &artifacts_dir,
                &started_at,
                started,
            ) {
                tracing::warn!("failed to write abort artifacts: {write_err}");
            }
            return Err(err);
        }
    };
    actions.record(&format!("resolved target {target}"));

    let mut ctx = ExecutionContext {
        run_id: run_id.clone(),
        scenario,
        clock,
        target: target.clone(),
        duration: opt.duration.unwrap_or(scenario.duration),
        sample_interval: opt.sample_interval.unwrap_or(scenario.sample_interval),
        tasks: TaskManager::new(),
        report: ReportBuilder::new(&run_id, &scenario.name, &target),
        actions,
        degraded: Vec::new(),
        state: PhaseState::PrereqOk,
    };

    let (verdict, aborted) = match opt.mode {
        RunMode::Remediate => {
            ctx.state = PhaseState::RemediateRequested;
            let strategy = opt.strategy.ok_or_else(|| {
                HavocError::InvalidArgument("remediate mode requires --strategy".to_string())
            })?;
            let mut policy = if opt.unattended || config.unattended {
                ConfirmationPolicy::AutoApprove
            } else {
                ConfirmationPolicy::stdin_prompt()
            };
            ctx.state = PhaseState::Remediate;
            let outcome = remediate(remote, &ctx.target, strategy, &mut policy, &ctx.actions)?;
            let sample = snapshot_to_sample(ctx.clock.now_ms(), &outcome.state);
            if let Err(err) = ctx.report.append(sample) {
                tracing::warn!("dropping sample: {err}");
            }
            (None, false)
        }
        RunMode::Cleanup => {
            ctx.state = PhaseState::Cleanup;
            let outcome = remote.cleanup(&ctx.target)?;
            ctx.actions
                .record(&format!("cleanup removed {} leftover(s)", outcome.removed));
            (None, false)
        }
        RunMode::DeployAndMonitor | RunMode::MonitorOnly => {
            let phases = ctx
                .scenario
                .phases
                .clone()
                .unwrap_or_else(|| default_phases(opt.mode));
            run_phases(&mut ctx, remote, &phases)
        }
    };

    // The final report is emitted unconditionally; a partial artifact from
    // an aborted run is still a legal one.
    ctx.tasks.refresh(remote);
    let sample_count = ctx.report.samples().len();
    let report = ctx.report.finish(verdict, aborted);
    let report_path = write_report(&report, &artifacts_dir)?;
    ctx.actions.record(&format!(
        "report written ({sample_count} sample(s), partial={aborted})"
    ));
    tracing::debug!("phase transition {:?} -> Done", ctx.state);
    ctx.state = PhaseState::Done;

    let finished_at = wall_time_iso_utc();
    let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    let summary = RunSummary {
        status: if aborted { RunStatus::Aborted } else { RunStatus::Completed },
        mode: opt.mode,
        run_id,
        scenario: scenario.name.clone(),
        target,
        verdict,
        partial: aborted,
        sample_count,
        degraded: ctx.degraded.clone(),
        report_path: Some(report_path.to_string_lossy().to_string()),
        actions_path: Some(ctx.actions.path().to_string_lossy().to_string()),
        started_at,
        finished_at,
        duration_ms,
    };
    write_run_manifest(&summary, &artifacts_dir)?;
    Ok(RunResult { summary })
}

/// Artifacts for a run that aborted before any phase could execute: an
/// empty partial report plus the manifest indexing it.
fn write_abort_artifacts(
    run_id: &str,
    scenario: &ScenarioDefinition,
    opt: &RunOptions,
    actions: &ActionLog,
    artifacts_dir: &Path,
    started_at: &str,
    started: Instant,
) -> HavocResult<()> {
    let report = ReportBuilder::new(run_id, &scenario.name, "unresolved").finish(None, true);
    let report_path = write_report(&report, artifacts_dir)?;
    actions.record("report written (0 sample(s), partial=true)");
    let summary = RunSummary {
        status: RunStatus::Aborted,
        mode: opt.mode,
        run_id: run_id.to_string(),
        scenario: scenario.name.clone(),
        target: "unresolved".to_string(),
        verdict: None,
        partial: true,
        sample_count: 0,
        degraded: Vec::new(),
        report_path: Some(report_path.to_string_lossy().to_string()),
        actions_path: Some(actions.path().to_string_lossy().to_string()),
        started_at: started_at.to_string(),
        finished_at: wall_time_iso_utc(),
        duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
    };
    write_run_manifest(&summary, artifacts_dir)?;
    Ok(())
}

fn effective_target_spec(scenario: &ScenarioDefinition, opt: &RunOptions) -> TargetSpec {
    if let Some(id) = &opt.target {
        TargetSpec::Explicit(id.clone())
    } else if let Some(selector) = &opt.selector {
        TargetSpec::Selector(selector.clone())
    } else {
        scenario.target.clone()
    }
}

/// Runs the phase list to completion or first hard failure. Returns the
/// analyzer verdict (when Analyze ran) and whether the run aborted.
fn run_phases(
    ctx: &mut ExecutionContext<'_>,
    remote: &dyn RemoteExecutor,
    phases: &[PhaseSpec],
) -> (Option<Verdict>, bool) {
    let mut verdict = None;
    for phase in phases {
        let next = state_for(phase.action);
        tracing::debug!("phase transition {:?} -> {:?} ({})", ctx.state, next, phase.name);
        ctx.state = next;
        let outcome = execute_phase(ctx, remote, phase, &mut verdict);
        match outcome {
            PhaseOutcome::Succeed => {}
            PhaseOutcome::SoftFail(msg) => {
                tracing::warn!("phase {} degraded: {msg}", phase.name);
                ctx.actions.record(&format!("phase {} degraded: {msg}", phase.name));
                ctx.degraded.push(format!("{}: {msg}", phase.name));
            }
            PhaseOutcome::HardFail(msg) => {
                tracing::error!("phase {} failed: {msg}", phase.name);
                ctx.actions
                    .record(&format!("phase {} failed, aborting run: {msg}", phase.name));
                return (verdict, true);
            }
        }
    }
    (verdict, false)
}

fn execute_phase(
    ctx: &mut ExecutionContext<'_>,
    remote: &dyn RemoteExecutor,
    phase: &PhaseSpec,
    verdict: &mut Option<Verdict>,
) -> PhaseOutcome {
    let result = match phase.action {
        PhaseAction::Deploy => deploy(ctx, remote),
        PhaseAction::Verify => verify(ctx, remote),
        PhaseAction::Load => load(ctx, remote),
        PhaseAction::Monitor => monitor(ctx, remote),
        PhaseAction::Analyze => {
            let v = analyzer::classify(ctx.report.samples(), &ctx.scenario.signature);
            ctx.actions.record(&format!("analyzed window: {v:?}"));
            *verdict = Some(v);
            Ok(())
        }
        PhaseAction::Report => {
            // Assembly is deferred to the unconditional final write.
            ctx.actions
                .record(&format!("report assembly queued ({} sample(s))", ctx.report.samples().len()));
            Ok(())
        }
        PhaseAction::Remediate => {
            Err(HavocError::InvalidArgument(
                "remediate is a run mode, not an in-scenario phase".to_string(),
            ))
        }
        PhaseAction::Cleanup => cleanup(ctx, remote),
    };

    match result {
        Ok(()) => PhaseOutcome::Succeed,
        Err(err) if phase.mandatory => PhaseOutcome::HardFail(err.to_string()),
        Err(err) => PhaseOutcome::SoftFail(err.to_string()),
    }
}

fn deploy(ctx: &mut ExecutionContext<'_>, remote: &dyn RemoteExecutor) -> HavocResult<()> {
    match ctx.scenario.constraint.kind {
        ConstraintKind::LockContention => {
            // The injected condition is a held lock; its hold loop runs
            // remotely for the full experiment window.
            ctx.tasks.dispatch(
                remote,
                &ctx.clock,
                &ctx.target,
                TaskKind::LockHolder,
                ctx.duration,
            )?;
        }
        ConstraintKind::Quota | ConstraintKind::NodePressure => {
            remote.apply_constraint(&ctx.target, &ctx.scenario.constraint)?;
        }
    }
    ctx.actions.record(&format!(
        "deployed {:?} constraint against {}",
        ctx.scenario.constraint.kind, ctx.target
    ));
    Ok(())
}

fn verify(ctx: &mut ExecutionContext<'_>, remote: &dyn RemoteExecutor) -> HavocResult<()> {
    if !remote.verify_constraint(&ctx.target)? {
        return Err(HavocError::RemoteExecution(format!(
            "injected condition not observable on {}",
            ctx.target
        )));
    }
    ctx.actions.record(&format!("verified condition present on {}", ctx.target));
    Ok(())
}

fn load(ctx: &mut ExecutionContext<'_>, remote: &dyn RemoteExecutor) -> HavocResult<()> {
    // Fire and forget: the executor moves on while load runs remotely.
    ctx.tasks.dispatch(
        remote,
        &ctx.clock,
        &ctx.target,
        TaskKind::LoadGenerator,
        ctx.duration,
    )?;
    Ok(())
}

fn monitor(ctx: &mut ExecutionContext<'_>, remote: &dyn RemoteExecutor) -> HavocResult<()> {
    let window = ctx.duration + ctx.scenario.grace_period;
    // Remote sampler, also not awaited.
    let sampler = ctx
        .tasks
        .dispatch(remote, &ctx.clock, &ctx.target, TaskKind::Sampler, window)
        .map(|_| ());
    if let Err(err) = sampler {
        tracing::warn!("sampler dispatch failed, sampling locally only: {err}");
        ctx.degraded.push(format!("monitor: sampler dispatch failed: {err}"));
    }

    // One sample per interval across duration + grace, so at least one
    // sample lands after the condition's expected release.
    let interval_ms = ctx.sample_interval.as_millis().max(1) as u64;
    let duration_ms = ctx.duration.as_millis().min(u128::from(u64::MAX)) as u64;
    let ticks = duration_ms.div_ceil(interval_ms) + 1;

    let mut missed = 0u64;
    for _ in 0..ticks {
        ctx.clock.sleep(ctx.sample_interval);
        match remote.sample_state(&ctx.target) {
            Ok(snapshot) => {
                let sample = snapshot_to_sample(ctx.clock.now_ms(), &snapshot);
                if let Err(err) = ctx.report.append(sample) {
                    tracing::warn!("dropping sample: {err}");
                }
            }
            Err(err) => {
                missed += 1;
                tracing::warn!("sample failed: {err}");
            }
        }
    }
    // The loop sleeps ticks * interval, which covers the grace window but
    // rarely equals it; log the span actually sampled.
    let sampled_secs = ticks * interval_ms / 1000;
    ctx.actions.record(&format!(
        "monitored {} for {sampled_secs}s ({} sample(s), {missed} missed)",
        ctx.target,
        ctx.report.samples().len()
    ));
    if missed == ticks {
        return Err(HavocError::RemoteExecution(
            "no samples could be collected".to_string(),
        ));
    }
    Ok(())
}

fn cleanup(ctx: &mut ExecutionContext<'_>, remote: &dyn RemoteExecutor) -> HavocResult<()> {
    let outcome = remote.cleanup(&ctx.target)?;
    ctx.actions
        .record(&format!("cleanup removed {} leftover(s)", outcome.removed));
    Ok(())
}

fn snapshot_to_sample(timestamp_ms: u64, snapshot: &StateSnapshot) -> Sample {
    Sample {
        timestamp_ms,
        desired: snapshot.desired,
        current: snapshot.current,
        pending: snapshot.pending.clone(),
        locks: snapshot.locks.clone(),
        events: snapshot.events.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phase_lists_match_modes() {
        let full = default_phases(RunMode::DeployAndMonitor);
        assert_eq!(full.len(), 7);
        assert!(full[0].mandatory && full[1].mandatory);
        assert!(full[2..].iter().all(|p| !p.mandatory));

        let monitor = default_phases(RunMode::MonitorOnly);
        assert_eq!(monitor[0].action, PhaseAction::Monitor);
        assert!(default_phases(RunMode::Cleanup).is_empty());
    }
}
