//! Failure-signature analysis over the monitor sample window.

use crate::{Sample, Verdict};

/// Classifies the collected window against the scenario's expected
/// insufficiency patterns.
///
/// Verified requires both halves of the signature: a desired-vs-current
/// capacity mismatch somewhere in the window, and at least one pending unit
/// whose condition matches a pattern. One half without the other is
/// Inconclusive; neither is NotObserved. All three are terminal verdicts,
/// never errors.
pub fn classify(samples: &[Sample], patterns: &[String]) -> Verdict {
    let mismatch = samples.iter().any(|s| s.desired != s.current);
    let condition = samples.iter().any(|s| {
        s.pending
            .iter()
            .any(|unit| matches_any(&unit.condition, patterns))
    });

    match (mismatch, condition) {
        (true, true) => Verdict::Verified,
        (false, false) => Verdict::NotObserved,
        _ => Verdict::Inconclusive,
    }
}

fn matches_any(condition: &str, patterns: &[String]) -> bool {
    let condition = condition.to_ascii_lowercase();
    patterns
        .iter()
        .any(|p| condition.contains(&p.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PendingUnit;

    fn sample(desired: u32, current: u32, conditions: &[&str]) -> Sample {
        Sample {
            timestamp_ms: 0,
            desired,
            current,
            pending: conditions
                .iter()
                .enumerate()
                .map(|(i, c)| PendingUnit {
                    name: format!("unit-{i}"),
                    condition: c.to_string(),
                })
                .collect(),
            locks: Vec::new(),
            events: Vec::new(),
        }
    }

    fn patterns() -> Vec<String> {
        vec!["insufficient-resource".to_string(), "quota".to_string()]
    }

    #[test]
    fn mismatch_with_matching_condition_is_verified() {
        let window = [sample(5, 2, &["insufficient-resource: 0/3 nodes available"])];
        assert_eq!(classify(&window, &patterns()), Verdict::Verified);
    }

    #[test]
    fn healthy_window_is_not_observed() {
        let window = [sample(2, 2, &[])];
        assert_eq!(classify(&window, &patterns()), Verdict::NotObserved);
    }

    #[test]
    fn mismatch_without_matching_condition_is_inconclusive() {
        let window = [sample(5, 2, &["image-pull-backoff"])];
        assert_eq!(classify(&window, &patterns()), Verdict::Inconclusive);
        let window = [sample(5, 2, &[])];
        assert_eq!(classify(&window, &patterns()), Verdict::Inconclusive);
    }

    #[test]
    fn condition_without_mismatch_is_inconclusive() {
        let window = [sample(3, 3, &["quota-exhausted: exceeded namespace quota"])];
        assert_eq!(classify(&window, &patterns()), Verdict::Inconclusive);
    }

    #[test]
    fn halves_may_come_from_different_samples() {
        let window = [
            sample(5, 2, &[]),
            sample(5, 5, &["quota-exhausted: exceeded namespace quota"]),
        ];
        assert_eq!(classify(&window, &patterns()), Verdict::Verified);
    }

    #[test]
    fn empty_window_is_not_observed() {
        assert_eq!(classify(&[], &patterns()), Verdict::NotObserved);
    }
}
