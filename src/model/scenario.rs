//! Scenario file parsing and validation.
//!
//! A scenario is one chaos experiment definition: which resource to target,
//! which condition to inject, how long to hold it, and which failure
//! signature the analyzer should look for. Candidate resource lists and
//! fixed identifiers are scenario-owned data, never engine logic.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Config, HavocError, HavocResult, parse_duration};

#[derive(Debug, Clone)]
pub struct ScenarioPath {
    path: PathBuf,
}

impl ScenarioPath {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

/// How the scenario names its target resource. Exactly one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetSpec {
    /// Used verbatim; no discovery probing is performed.
    Explicit(String),
    /// First match in listing order. Order is not stable across calls;
    /// callers needing determinism must supply an explicit id.
    Selector(String),
    /// Probed sequentially against the existence predicate; first hit wins.
    Candidates(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Namespace quota capped below the workload's desired capacity.
    Quota,
    /// Node-resource shortage simulated by capping schedulable capacity.
    NodePressure,
    /// A lock-holder session pinning the target's hot row/table.
    LockContention,
}

/// The injected condition, as scenario data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub kind: ConstraintKind,
    /// Capacity cap for quota/node-pressure constraints.
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseAction {
    Deploy,
    Verify,
    Load,
    Monitor,
    Analyze,
    Report,
    Remediate,
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub action: PhaseAction,
    #[serde(default)]
    pub timeout: Option<String>,
    /// Mandatory phases hard-fail the run; others soft-fail and advance.
    #[serde(default)]
    pub mandatory: bool,
}

/// On-disk scenario shape (versioned JSON, like every other havoc artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub version: u32,
    pub name: String,
    /// Target system identifier (cluster namespace).
    pub system: String,
    pub target: TargetSpec,
    pub constraint: ConstraintSpec,
    /// Pending-condition patterns that confirm the expected insufficiency
    /// (substring match, e.g. "insufficient-resource", "quota", "lock").
    pub signature: Vec<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub sample_interval: Option<String>,
    #[serde(default)]
    pub grace_period: Option<String>,
    /// Desired workload capacity, used when rehearsing against the scripted
    /// backend. Real targets define their own.
    #[serde(default)]
    pub desired_capacity: Option<u32>,
    /// Optional explicit phase list; the engine supplies the standard
    /// deploy-and-monitor sequence when absent.
    #[serde(default)]
    pub phases: Option<Vec<PhaseSpec>>,
}

/// Validated, read-only scenario for one run.
#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    pub name: String,
    pub system: String,
    pub target: TargetSpec,
    pub constraint: ConstraintSpec,
    pub signature: Vec<String>,
    pub duration: Duration,
    pub sample_interval: Duration,
    pub grace_period: Duration,
    pub desired_capacity: u32,
    pub phases: Option<Vec<PhaseSpec>>,
}

impl ScenarioDefinition {
    pub fn load(path: &ScenarioPath, config: &Config) -> HavocResult<Self> {
        let bytes = std::fs::read(path.as_path())?;
        let file: ScenarioFile = serde_json::from_slice(&bytes).map_err(|err| {
            HavocError::Scenario(format!(
                "failed to parse scenario {}: {err}. expected \
                 {{version,name,system,target:{{explicit|selector|candidates}},\
                 constraint:{{kind,limit?}},signature:[...]}}",
                path.as_path().display()
            ))
        })?;
        Self::from_file(file, config)
    }

    pub fn from_file(file: ScenarioFile, config: &Config) -> HavocResult<Self> {
        if file.version != 1 {
            return Err(HavocError::Scenario(format!(
                "unsupported scenario version {} (expected 1)",
                file.version
            )));
        }
        if file.name.is_empty() {
            return Err(HavocError::Scenario("scenario name must not be empty".to_string()));
        }
        match &file.target {
            TargetSpec::Explicit(id) if id.is_empty() => {
                return Err(HavocError::Scenario("target.explicit must not be empty".to_string()));
            }
            TargetSpec::Candidates(list) if list.is_empty() => {
                return Err(HavocError::Scenario(
                    "target.candidates must list at least one resource".to_string(),
                ));
            }
            _ => {}
        }
        if file.signature.is_empty() {
            return Err(HavocError::Scenario(
                "signature must list at least one expected condition pattern".to_string(),
            ));
        }

        let duration = parse_duration(file.duration.as_deref().unwrap_or(&config.duration))?;
        let sample_interval =
            parse_duration(file.sample_interval.as_deref().unwrap_or(&config.sample_interval))?;
        let grace_period =
            parse_duration(file.grace_period.as_deref().unwrap_or(&config.grace_period))?;
        if sample_interval.is_zero() {
            return Err(HavocError::Scenario("sample_interval must be > 0".to_string()));
        }

        if let Some(phases) = &file.phases {
            for phase in phases {
                if let Some(timeout) = &phase.timeout {
                    parse_duration(timeout)?;
                }
            }
        }

        Ok(Self {
            name: file.name,
            system: if file.system.is_empty() { config.namespace.clone() } else { file.system },
            target: file.target,
            constraint: file.constraint,
            signature: file.signature,
            duration,
            sample_interval,
            grace_period,
            desired_capacity: file.desired_capacity.unwrap_or(3),
            phases: file.phases,
        })
    }

    pub fn example() -> ScenarioFile {
        ScenarioFile {
            version: 1,
            name: "quota-starvation".to_string(),
            system: "chaos-lab".to_string(),
            target: TargetSpec::Candidates(vec![
                "orders-api".to_string(),
                "orders".to_string(),
            ]),
            constraint: ConstraintSpec {
                kind: ConstraintKind::Quota,
                limit: Some(2),
            },
            signature: vec!["quota".to_string(), "insufficient-resource".to_string()],
            duration: Some("60s".to_string()),
            sample_interval: Some("10s".to_string()),
            grace_period: Some("10s".to_string()),
            desired_capacity: Some(5),
            phases: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_scenario_validates() {
        let def = ScenarioDefinition::from_file(ScenarioDefinition::example(), &Config::default())
            .unwrap();
        assert_eq!(def.name, "quota-starvation");
        assert_eq!(def.duration, Duration::from_secs(60));
        assert_eq!(def.desired_capacity, 5);
    }

    #[test]
    fn empty_candidates_rejected() {
        let mut file = ScenarioDefinition::example();
        file.target = TargetSpec::Candidates(Vec::new());
        let err = ScenarioDefinition::from_file(file, &Config::default()).unwrap_err();
        assert!(matches!(err, HavocError::Scenario(_)));
    }

    #[test]
    fn zero_interval_rejected() {
        let mut file = ScenarioDefinition::example();
        file.sample_interval = Some("0s".to_string());
        assert!(ScenarioDefinition::from_file(file, &Config::default()).is_err());
    }

    #[test]
    fn target_spec_round_trips_as_tagged_json() {
        let spec: TargetSpec =
            serde_json::from_str(r#"{"candidates":["a","b"]}"#).unwrap();
        assert_eq!(spec, TargetSpec::Candidates(vec!["a".into(), "b".into()]));
        let spec: TargetSpec = serde_json::from_str(r#"{"explicit":"orders"}"#).unwrap();
        assert_eq!(spec, TargetSpec::Explicit("orders".into()));
    }
}
