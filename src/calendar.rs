//! Calendar management for the clinic scheduling system.
//!
//! This module provides the ClinicCalendar which turns a clinic's weekly
//! operating-hours template and holiday list into the bookable slot grid
//! for a given date.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ClinicError;
use crate::models::{parse_slot_label, TimeSlot};

pub const DEFAULT_SLOT_MINUTES: u32 = 30;

/// Operating hours for one day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub is_open: bool,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
}

impl DayHours {
    /// Create open hours with validation.
    pub fn open(open_time: NaiveTime, close_time: NaiveTime) -> Result<Self, ClinicError> {
        if close_time <= open_time {
            return Err(ClinicError::InvalidInput(
                "Closing time must be after opening time".to_string(),
            ));
        }
        Ok(DayHours {
            is_open: true,
            open_time,
            close_time,
        })
    }

    pub fn closed() -> Self {
        DayHours {
            is_open: false,
            open_time: NaiveTime::MIN,
            close_time: NaiveTime::MIN,
        }
    }
}

/// Weekly operating-hours template. Days without an entry are closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: BTreeMap<u32, DayHours>,
}

impl WeeklyHours {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same hours on every listed weekday, everything else closed.
    pub fn uniform(days: &[Weekday], open: &str, close: &str) -> Result<Self, ClinicError> {
        let hours = DayHours::open(parse_slot_label(open)?, parse_slot_label(close)?)?;
        let mut weekly = WeeklyHours::new();
        for day in days {
            weekly.set(*day, hours);
        }
        Ok(weekly)
    }

    pub fn set(&mut self, day: Weekday, hours: DayHours) {
        self.days.insert(day.num_days_from_monday(), hours);
    }

    pub fn get(&self, day: Weekday) -> DayHours {
        self.days
            .get(&day.num_days_from_monday())
            .copied()
            .unwrap_or_else(DayHours::closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// Result of asking the calendar about one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub is_open: bool,
    pub reason: Option<String>,
    pub slots: Vec<TimeSlot>,
}

impl DaySchedule {
    /// Find the slot booked under `label`, if it is on this day's grid.
    pub fn find_slot(&self, label: &str) -> Option<&TimeSlot> {
        let start = parse_slot_label(label).ok()?;
        self.slots.iter().find(|slot| slot.start_time == start)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicCalendar {
    pub hours: WeeklyHours,
    pub holidays: Vec<Holiday>,
    pub slot_minutes: u32,
}

impl ClinicCalendar {
    /// Initialize a new clinic calendar.
    pub fn new(
        hours: WeeklyHours,
        holidays: Vec<Holiday>,
        slot_minutes: u32,
    ) -> Result<Self, ClinicError> {
        if slot_minutes == 0 {
            return Err(ClinicError::InvalidInput(
                "Slot duration must be positive".to_string(),
            ));
        }
        Ok(ClinicCalendar {
            hours,
            holidays,
            slot_minutes,
        })
    }

    pub fn holiday_on(&self, date: NaiveDate) -> Option<&Holiday> {
        self.holidays.iter().find(|h| h.date == date)
    }

    /// Produce the ordered slot grid for a date.
    ///
    /// A closed weekday or a holiday yields `is_open = false` and no slots.
    /// Slots start at opening time; a final slot that would run past closing
    /// time is dropped.
    pub fn slots_for(&self, date: NaiveDate) -> DaySchedule {
        let day = self.hours.get(date.weekday());

        if !day.is_open {
            return DaySchedule {
                date,
                is_open: false,
                reason: Some(format!("Clinic is closed on {}", weekday_name(date.weekday()))),
                slots: Vec::new(),
            };
        }

        if let Some(holiday) = self.holiday_on(date) {
            let reason = match &holiday.reason {
                Some(reason) => format!("Holiday: {reason}"),
                None => "Clinic holiday".to_string(),
            };
            return DaySchedule {
                date,
                is_open: false,
                reason: Some(reason),
                slots: Vec::new(),
            };
        }

        DaySchedule {
            date,
            is_open: true,
            reason: None,
            slots: self.generate_slots(day.open_time, day.close_time),
        }
    }

    fn generate_slots(&self, open: NaiveTime, close: NaiveTime) -> Vec<TimeSlot> {
        let step = Duration::minutes(i64::from(self.slot_minutes));
        let mut slots = Vec::new();
        let mut current = open;

        loop {
            // overflowing_add_signed wraps past midnight; a wrap means we ran off the day.
            let (slot_end, wrapped) = current.overflowing_add_signed(step);
            if wrapped != 0 || slot_end > close || slot_end <= current {
                break;
            }
            if let Ok(slot) = TimeSlot::new(current, slot_end) {
                slots.push(slot);
            }
            current = slot_end;
        }

        slots
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

impl std::fmt::Display for ClinicCalendar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClinicCalendar(slot={}m, holidays={})",
            self.slot_minutes,
            self.holidays.len()
        )
    }
}
