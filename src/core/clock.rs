//! Clock seam.
//!
//! Execution captures one timestamp per task start; every `tt.timestamp*`
//! reference inside that task sees the same value. Tests substitute a
//! fixed clock.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    fn now_unix(&self) -> u64 {
        self.now().timestamp().max(0) as u64
    }

    /// ISO-8601 UTC, second precision, `Z` suffix.
    fn now_iso8601(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).unwrap()
    }
}
