//! Time source shared by every monitor.
//!
//! All windows, heartbeats and event timestamps read time through [`Clock`] so
//! that drills and tests can drive time explicitly.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::fmt::Debug;
use std::sync::Mutex;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Current time truncated to the microsecond precision of persisted records.
    fn stamp(&self) -> DateTime<Utc> {
        self.now().trunc_subsecs(6)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start.trunc_subsecs(6)),
        }
    }

    /// Starts at a fixed, round instant.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();
        clock.advance_secs(11);
        assert_eq!((clock.now() - start).num_seconds(), 11);
    }

    #[test]
    fn test_stamp_truncates_to_micros() {
        let clock = SystemClock;
        let stamped = clock.stamp();
        assert_eq!(stamped.timestamp_subsec_nanos() % 1_000, 0);
    }
}
