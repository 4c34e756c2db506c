//! Resource locator: resolves an abstract target spec to one concrete
//! resource.

use crate::{HavocError, HavocResult, RemoteExecutor, TargetSpec};

/// Caches its answer for the life of one execution context; a resolved
/// target never changes afterwards.
#[derive(Debug, Default)]
pub struct ResourceLocator {
    resolved: Option<String>,
}

impl ResourceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(&self) -> Option<&str> {
        self.resolved.as_deref()
    }

    pub fn resolve(
        &mut self,
        remote: &dyn RemoteExecutor,
        spec: &TargetSpec,
    ) -> HavocResult<String> {
        if let Some(target) = &self.resolved {
            return Ok(target.clone());
        }
        let target = resolve_target(remote, spec)?;
        self.resolved = Some(target.clone());
        Ok(target)
    }
}

pub fn resolve_target(remote: &dyn RemoteExecutor, spec: &TargetSpec) -> HavocResult<String> {
    match spec {
        // Explicit input is trusted verbatim; no probing.
        TargetSpec::Explicit(id) => Ok(id.clone()),
        TargetSpec::Selector(selector) => {
            let matches = remote.list_by_selector(selector)?;
            matches.into_iter().next().ok_or_else(|| {
                HavocError::NotFound(format!("no resource matches selector {selector:?}"))
            })
        }
        TargetSpec::Candidates(candidates) => {
            for candidate in candidates {
                tracing::debug!("probing candidate {candidate}");
                if remote.probe_resource(candidate)? {
                    return Ok(candidate.clone());
                }
            }
            Err(HavocError::NotFound(format!(
                "no candidate exists on the target (tried: {})",
                candidates.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClockMode, EngineClock, ScriptedRemote};
    use std::sync::Arc;

    fn remote_with(resources: &[&str]) -> ScriptedRemote {
        let clock = Arc::new(EngineClock::new(ClockMode::Virtual));
        let remote = ScriptedRemote::new(clock);
        for name in resources {
            remote.add_resource(name, 3, &[]);
        }
        remote
    }

    #[test]
    fn explicit_id_never_probes() {
        let remote = remote_with(&["orders"]);
        let target = resolve_target(&remote, &TargetSpec::Explicit("anything".to_string())).unwrap();
        assert_eq!(target, "anything");
        assert_eq!(remote.probes(), 0);
    }

    #[test]
    fn candidates_resolve_to_first_existing() {
        let remote = remote_with(&["orders"]);
        remote.add_table("appdb", "orders_archive");
        let spec = TargetSpec::Candidates(vec![
            "missing".to_string(),
            "orders".to_string(),
            "orders_archive".to_string(),
        ]);
        assert_eq!(resolve_target(&remote, &spec).unwrap(), "orders");
        // Stopped at the first hit: probed "missing" and "orders" only.
        assert_eq!(remote.probes(), 2);
    }

    #[test]
    fn candidates_probe_store_tables_too() {
        let remote = remote_with(&[]);
        remote.add_table("appdb", "orders_archive");
        let spec = TargetSpec::Candidates(vec!["orders_archive".to_string()]);
        assert_eq!(resolve_target(&remote, &spec).unwrap(), "orders_archive");
    }

    #[test]
    fn missing_candidates_are_not_found() {
        let remote = remote_with(&["orders"]);
        let spec = TargetSpec::Candidates(vec!["a".to_string(), "b".to_string()]);
        let err = resolve_target(&remote, &spec).unwrap_err();
        assert!(matches!(err, HavocError::NotFound(_)));
        assert_eq!(remote.probes(), 2);
    }

    #[test]
    fn locator_caches_for_the_context_lifetime() {
        let remote = remote_with(&["orders"]);
        let spec = TargetSpec::Candidates(vec!["orders".to_string()]);
        let mut locator = ResourceLocator::new();
        assert_eq!(locator.resolve(&remote, &spec).unwrap(), "orders");
        assert_eq!(locator.resolve(&remote, &spec).unwrap(), "orders");
        assert_eq!(remote.probes(), 1);
    }
}
