//! Wall-clock source for the control loop. Schedules are matched against local
//! HH:MM, so the clock carries the greenhouse's UTC offset.

use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Minutes since local midnight, 0..1440.
pub fn minute_of_day(t: OffsetDateTime) -> u16 {
    t.hour() as u16 * 60 + t.minute() as u16
}

/// Render a minute-of-day as `HH:MM`.
pub fn hhmm(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) struct ManualClock {
    now: std::sync::Mutex<OffsetDateTime>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn at(now: OffsetDateTime) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub(crate) fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}
