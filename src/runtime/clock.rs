//! Engine clock: wall time or virtual time.
//!
//! Sampling loops and the scripted backend's task expiry read the same
//! shared clock, so duration-based runs can execute instantly under the
//! virtual mode while keeping monotonic timestamps.

use serde::{Deserialize, Serialize};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    Wall,
    Virtual,
}

impl clap::ValueEnum for ClockMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Wall, Self::Virtual]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Wall => clap::builder::PossibleValue::new("wall"),
            Self::Virtual => clap::builder::PossibleValue::new("virtual"),
        })
    }
}

#[derive(Debug)]
pub struct EngineClock {
    mode: ClockMode,
    origin: Instant,
    virtual_ms: AtomicU64,
}

impl EngineClock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            origin: Instant::now(),
            virtual_ms: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Milliseconds since the clock's origin. Monotonic in both modes.
    pub fn now_ms(&self) -> u64 {
        match self.mode {
            ClockMode::Wall => self
                .origin
                .elapsed()
                .as_millis()
                .min(u128::from(u64::MAX)) as u64,
            ClockMode::Virtual => self.virtual_ms.load(Ordering::SeqCst),
        }
    }

    /// Blocks on the wall clock; advances instantly on the virtual clock.
    pub fn sleep(&self, d: Duration) {
        match self.mode {
            ClockMode::Wall => std::thread::sleep(d),
            ClockMode::Virtual => self.advance(d),
        }
    }

    pub fn advance(&self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        self.virtual_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

/// RFC3339 wall timestamp for run metadata (startedAt/finishedAt and the
/// action log); never used for engine decisions.
pub fn wall_time_iso_utc() -> String {
    let now = SystemTime::now();
    let dt: time::OffsetDateTime = now.into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_advances_on_sleep() {
        let clock = EngineClock::new(ClockMode::Virtual);
        assert_eq!(clock.now_ms(), 0);
        clock.sleep(Duration::from_secs(10));
        assert_eq!(clock.now_ms(), 10_000);
        clock.sleep(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 10_250);
    }
}
