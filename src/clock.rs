//! Time source for the services. "Today" is the clinic-local calendar day.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate;
}

/// Wall clock; the clinic runs in the host's local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually driven clock for tests and demos.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(date: NaiveDate, time: NaiveTime) -> Self {
        FixedClock {
            now: Mutex::new(date.and_time(time).and_utc()),
        }
    }

    pub fn on(date: NaiveDate) -> Self {
        Self::at(date, NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default())
    }

    pub fn set_date(&self, date: NaiveDate) {
        if let Ok(mut now) = self.now.lock() {
            *now = date.and_time(now.time()).and_utc();
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}
