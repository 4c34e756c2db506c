//! Remediation controller: reverses an injected condition and re-verifies
//! once.

use serde::{Deserialize, Serialize};

use std::io::{BufRead, Write};

use crate::{ActionLog, HavocError, HavocResult, RemoteExecutor, StateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStrategy {
    /// Lift the constraint's cap but leave it in place.
    RelaxConstraint,
    /// Delete the constraint outright.
    RemoveConstraint,
    /// Forcibly terminate the remote session holding the resource.
    TerminateSession,
}

impl clap::ValueEnum for RemediationStrategy {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::RelaxConstraint, Self::RemoveConstraint, Self::TerminateSession]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::RelaxConstraint => clap::builder::PossibleValue::new("relax-constraint"),
            Self::RemoveConstraint => clap::builder::PossibleValue::new("remove-constraint"),
            Self::TerminateSession => clap::builder::PossibleValue::new("terminate-session"),
        })
    }
}

impl RemediationStrategy {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::RelaxConstraint => "relax the injected constraint",
            Self::RemoveConstraint => "remove the injected constraint",
            Self::TerminateSession => "terminate the remote session holding the resource",
        }
    }
}

/// How the controller obtains confirmation before mutating anything.
pub enum ConfirmationPolicy {
    AutoApprove,
    PromptUser(Box<dyn FnMut(&str) -> HavocResult<bool>>),
}

impl std::fmt::Debug for ConfirmationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoApprove => f.write_str("AutoApprove"),
            Self::PromptUser(_) => f.write_str("PromptUser"),
        }
    }
}

impl ConfirmationPolicy {
    /// Interactive policy reading y/n from stdin.
    pub fn stdin_prompt() -> Self {
        Self::PromptUser(Box::new(|prompt| {
            let mut out = std::io::stderr();
            write!(out, "{prompt} [y/N] ")?;
            out.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let answer = line.trim().to_ascii_lowercase();
            Ok(answer == "y" || answer == "yes")
        }))
    }

    fn confirm(&mut self, prompt: &str) -> HavocResult<bool> {
        match self {
            Self::AutoApprove => Ok(true),
            Self::PromptUser(channel) => channel(prompt),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub strategy: RemediationStrategy,
    /// Result of the single re-verification after the action.
    #[serde(rename = "constraintCleared")]
    pub constraint_cleared: bool,
    pub state: StateSnapshot,
}

/// Performs exactly one remediation action, then exactly one
/// re-verification. A declined confirmation returns `UserCancelled` before
/// any mutation.
pub fn remediate(
    remote: &dyn RemoteExecutor,
    target: &str,
    strategy: RemediationStrategy,
    policy: &mut ConfirmationPolicy,
    actions: &ActionLog,
) -> HavocResult<RemediationOutcome> {
    let prompt = format!("{} on {target}?", strategy.describe());
    if !policy.confirm(&prompt)? {
        actions.record(&format!("remediation declined ({})", strategy.describe()));
        return Err(HavocError::UserCancelled);
    }

    match strategy {
        RemediationStrategy::RelaxConstraint => {
            remote.relax_constraint(target)?;
            actions.record(&format!("relaxed constraint on {target}"));
        }
        RemediationStrategy::RemoveConstraint => {
            remote.remove_constraint(target)?;
            actions.record(&format!("removed constraint from {target}"));
        }
        RemediationStrategy::TerminateSession => {
            let snapshot = remote.sample_state(target)?;
            let holder = snapshot
                .locks
                .iter()
                .find(|l| l.granted)
                .map(|l| l.session.clone())
                .ok_or_else(|| {
                    HavocError::InvalidArgument(format!("no session holds a lock on {target}"))
                })?;
            remote.terminate_session(&holder)?;
            actions.record(&format!("terminated session {holder} holding {target}"));
        }
    }

    let constraint_cleared = !remote.verify_constraint(target)?;
    let state = remote.sample_state(target)?;
    actions.record(&format!(
        "re-verified {target}: constraint_cleared={constraint_cleared} desired={} current={}",
        state.desired, state.current
    ));

    Ok(RemediationOutcome {
        strategy,
        constraint_cleared,
        state,
    })
}
