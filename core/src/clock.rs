//! Ledger clock: the source of "now" for acquisitions and debits.
//!
//! Scheduled jobs receive `now` explicitly from their trigger. On-demand
//! operations read it from a [`LedgerClock`] so tests and replays can drive time.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait LedgerClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LedgerClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. One call to `advance_days(1)`
/// is one simulated day.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut current) = self.current.lock() {
            *current = at;
        }
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(mut current) => {
                *current += by;
                *current
            }
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn advance_days(&self, days: i64) -> DateTime<Utc> {
        self.advance(Duration::days(days))
    }
}

impl LedgerClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_moves_only_on_request() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.advance_days(365), start + Duration::days(365));
        assert_eq!(clock.now(), start + Duration::days(365));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
