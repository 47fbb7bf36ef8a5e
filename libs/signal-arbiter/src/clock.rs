//! Clock abstraction for arbitration decisions
//!
//! Every timing decision (phase elapsed, override deadline, ledger stamps)
//! reads wall-clock local time through this trait, so tests can drive time
//! explicitly instead of sleeping.

use chrono::{Local, NaiveDateTime, TimeDelta};
use parking_lot::Mutex;

/// Source of local wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// System local time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance_secs(&self, secs: i64) -> NaiveDateTime {
        let mut now = self.now.lock();
        *now += TimeDelta::seconds(secs);
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

/// Whole seconds from `earlier` to `later`, never negative
pub(crate) fn elapsed_secs(earlier: NaiveDateTime, later: NaiveDateTime) -> u32 {
    (later - earlier).num_seconds().max(0) as u32
}
