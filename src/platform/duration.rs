//! Parsing for CLI duration values (e.g. "250ms", "30s", "5m", "2h").

use std::str::FromStr;
use std::time::Duration;

use crate::{HavocError, HavocResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HavocDuration(pub Duration);

impl FromStr for HavocDuration {
    type Err = HavocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

pub fn parse_duration(input: &str) -> HavocResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(HavocError::InvalidArgument("empty duration".to_string()));
    }

    let split = s
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    if split == 0 {
        return Err(HavocError::InvalidArgument(format!(
            "invalid duration {s:?} (missing number)"
        )));
    }
    if split == s.len() {
        return Err(HavocError::InvalidArgument(format!(
            "invalid duration {s:?} (missing unit; expected ms|s|m|h)"
        )));
    }

    let value: u64 = s[..split]
        .parse()
        .map_err(|_| HavocError::InvalidArgument(format!("invalid duration number in {input:?}")))?;

    match &s[split..] {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(60 * 60))),
        unit => Err(HavocError::InvalidArgument(format!(
            "invalid duration unit {unit:?} (expected ms|s|m|h)"
        ))),
    }
}
