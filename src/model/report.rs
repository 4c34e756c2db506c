//! Report, sample, and verdict types plus the per-run artifact writers.

use serde::{Deserialize, Serialize};

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::{HavocError, HavocResult, LockSnapshot, PendingUnit, wall_time_iso_utc};

/// Analyzer classification of observed behavior. All three are valid
/// terminal verdicts; none is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    NotObserved,
    Inconclusive,
}

/// One timestamped system-state snapshot. Self-contained and individually
/// valid regardless of what follows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    pub desired: u32,
    pub current: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingUnit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locks: Vec<LockSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub scenario: String,
    pub target: String,
    pub samples: Vec<Sample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Set when any mandatory phase failed; the artifact stays valid.
    pub partial: bool,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
}

/// Append-only report assembly. Samples must be strictly
/// timestamp-increasing; a violating append is rejected.
#[derive(Debug)]
pub struct ReportBuilder {
    run_id: String,
    scenario: String,
    target: String,
    started_at: String,
    samples: Vec<Sample>,
}

impl ReportBuilder {
    pub fn new(run_id: &str, scenario: &str, target: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            scenario: scenario.to_string(),
            target: target.to_string(),
            started_at: wall_time_iso_utc(),
            samples: Vec::new(),
        }
    }

    pub fn append(&mut self, sample: Sample) -> HavocResult<()> {
        if let Some(last) = self.samples.last()
            && sample.timestamp_ms <= last.timestamp_ms
        {
            return Err(HavocError::Report(format!(
                "non-monotonic sample: {}ms after {}ms",
                sample.timestamp_ms, last.timestamp_ms
            )));
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn finish(self, verdict: Option<Verdict>, partial: bool) -> Report {
        Report {
            schema_version: "havoc.report.v1".to_string(),
            run_id: self.run_id,
            scenario: self.scenario,
            target: self.target,
            samples: self.samples,
            verdict,
            partial,
            started_at: self.started_at,
            finished_at: wall_time_iso_utc(),
        }
    }
}

pub fn write_report(report: &Report, artifacts_dir: &Path) -> HavocResult<PathBuf> {
    std::fs::create_dir_all(artifacts_dir)?;
    let out = artifacts_dir.join("report.json");
    std::fs::write(&out, serde_json::to_vec_pretty(report)?)?;
    Ok(out)
}

/// Timestamped, append-only action log. One line per externally visible
/// engine action, mirrored to tracing.
#[derive(Debug)]
pub struct ActionLog {
    path: PathBuf,
}

impl ActionLog {
    pub fn create(artifacts_dir: &Path) -> HavocResult<Self> {
        std::fs::create_dir_all(artifacts_dir)?;
        let path = artifacts_dir.join("actions.log");
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, action: &str) {
        tracing::info!("{action}");
        let line = format!("{} {action}\n", wall_time_iso_utc());
        if let Err(err) = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
        {
            tracing::warn!("failed to append action log: {err}");
        }
    }
}

/// Per-run `manifest.json`: a summary index of the run directory so
/// artifacts remain interpretable without the process that wrote them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub mode: crate::RunMode,
    pub status: RunStatus,
    pub scenario: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub partial: bool,
    #[serde(rename = "sampleCount")]
    pub sample_count: usize,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "actionsPath", skip_serializing_if = "Option::is_none")]
    pub actions_path: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

pub fn write_run_manifest(summary: &RunSummary, artifacts_dir: &Path) -> HavocResult<PathBuf> {
    std::fs::create_dir_all(artifacts_dir)?;
    let manifest = RunManifest {
        schema_version: "havoc.run_manifest.v1".to_string(),
        run_id: summary.run_id.clone(),
        mode: summary.mode,
        status: summary.status,
        scenario: summary.scenario.clone(),
        target: summary.target.clone(),
        verdict: summary.verdict,
        partial: summary.partial,
        sample_count: summary.sample_count,
        report_path: summary.report_path.clone(),
        actions_path: summary.actions_path.clone(),
        started_at: summary.started_at.clone(),
        finished_at: summary.finished_at.clone(),
        duration_ms: summary.duration_ms,
    };
    let out = artifacts_dir.join("manifest.json");
    std::fs::write(&out, serde_json::to_vec_pretty(&manifest)?)?;
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// All mandatory phases ran; verdict may still be anything.
    Completed,
    /// A mandatory phase hard-failed; report written with whatever existed.
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub mode: crate::RunMode,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub scenario: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub partial: bool,
    #[serde(rename = "sampleCount")]
    pub sample_count: usize,
    /// Soft-failure notes from non-mandatory phases.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "actionsPath", skip_serializing_if = "Option::is_none")]
    pub actions_path: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "status={:?} mode={:?} runId={} scenario={} target={}\n",
            self.status, self.mode, self.run_id, self.scenario, self.target
        ));
        if let Some(verdict) = self.verdict {
            out.push_str(&format!("verdict={verdict:?}\n"));
        }
        if self.partial {
            out.push_str("partial=true\n");
        }
        out.push_str(&format!("samples={}\n", self.sample_count));
        for note in &self.degraded {
            out.push_str(&format!("- degraded: {note}\n"));
        }
        if let Some(path) = &self.report_path {
            out.push_str(&format!("report={path}\n"));
        }
        if let Some(path) = &self.actions_path {
            out.push_str(&format!("actions={path}\n"));
        }
        out.trim_end().to_string()
    }
}
