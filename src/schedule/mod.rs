//! Business-hours gate
//!
//! A pure evaluation of a weekly open/close table against an instant. Each
//! weekday is either closed or open over `[open, close)`; an interval whose
//! close time is not after its open time crosses midnight into the next day.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Minutes since midnight, `0..1440`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    /// Build from hour and minute
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the time is out of range
    pub fn new(hour: u16, minute: u16) -> Result<Self> {
        if hour >= 24 || minute >= 60 {
            return Err(Error::InvalidInput(format!("time out of range: {hour}:{minute}")));
        }
        Ok(Self(hour * 60 + minute))
    }

    /// Minutes since midnight
    #[must_use]
    pub const fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("expected HH:MM, got {s:?}")))?;
        let hour = h
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad hour in {s:?}")))?;
        let minute = m
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad minute in {s:?}")))?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opening hours for one weekday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

impl DayHours {
    /// Length of the interval in minutes; equal open and close means all day
    fn length(self) -> u16 {
        let len = (self.close.0 + MINUTES_PER_DAY - self.open.0) % MINUTES_PER_DAY;
        if len == 0 { MINUTES_PER_DAY } else { len }
    }
}

/// Weekly opening table; a missing day is closed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeeklySchedule {
    pub monday: Option<DayHours>,
    pub tuesday: Option<DayHours>,
    pub wednesday: Option<DayHours>,
    pub thursday: Option<DayHours>,
    pub friday: Option<DayHours>,
    pub saturday: Option<DayHours>,
    pub sunday: Option<DayHours>,
}

impl WeeklySchedule {
    /// Hours for a weekday
    #[must_use]
    pub const fn hours(&self, day: Weekday) -> Option<DayHours> {
        match day {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    /// Set the hours for a weekday
    pub const fn set(&mut self, day: Weekday, hours: Option<DayHours>) {
        let slot = match day {
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
            Weekday::Sun => &mut self.sunday,
        };
        *slot = hours;
    }

    /// Monday to Friday 09:00-18:00, Saturday 10:00-14:00, Sunday closed
    #[must_use]
    pub fn business_default() -> Self {
        let weekday = Some(DayHours {
            open: TimeOfDay(9 * 60),
            close: TimeOfDay(18 * 60),
        });
        Self {
            monday: weekday,
            tuesday: weekday,
            wednesday: weekday,
            thursday: weekday,
            friday: weekday,
            saturday: Some(DayHours {
                open: TimeOfDay(10 * 60),
                close: TimeOfDay(14 * 60),
            }),
            sunday: None,
        }
    }

    /// Minutes until close if `(day, minute)` falls inside an open interval
    ///
    /// Checks the interval that started today and the one that started
    /// yesterday and may still be running past midnight. An interval that
    /// closes exactly when the next one opens does not count as a close.
    fn minutes_until_close(&self, day: Weekday, minute: u16) -> Option<u16> {
        let day_len = i32::from(MINUTES_PER_DAY);
        let now = i32::from(minute);

        // Interval ends, in minutes from today's midnight
        let mut end = [(-1, day.pred()), (0, day)]
            .into_iter()
            .filter_map(|(days, weekday)| {
                let h = self.hours(weekday)?;
                let start = days * day_len + i32::from(h.open.0);
                let end = start + i32::from(h.length());
                (start <= now && now < end).then_some(end)
            })
            .max()?;

        for _ in 0..7 {
            let weekday = (0..end.div_euclid(day_len)).fold(day, |d, _| d.succ());
            match self.hours(weekday) {
                Some(h) if i32::from(h.open.0) == end.rem_euclid(day_len) => {
                    end += i32::from(h.length());
                }
                _ => break,
            }
        }

        Some(u16::try_from(end - now).unwrap_or(u16::MAX))
    }
}

/// Result of evaluating the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// Open, no advisory
    Open,
    /// Open, but closing within the warning threshold
    ClosingSoon {
        minutes_remaining: u16,
        message: String,
    },
    /// Closed; automated handling stops with this notice
    Closed { message: String },
}

impl GateStatus {
    /// Whether automated handling may proceed
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Closed { .. })
    }

    /// Advisory to append to replies, if any
    #[must_use]
    pub fn advisory(&self) -> Option<&str> {
        match self {
            Self::ClosingSoon { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Weekly schedule plus the messages and thresholds used to report on it
#[derive(Debug, Clone)]
pub struct ScheduleGate {
    pub schedule: WeeklySchedule,
    /// Minutes before close at which the closing-soon advisory starts
    pub warning_minutes: u16,
    /// Offset of business local time from UTC
    pub offset: FixedOffset,
    pub closed_message: String,
    /// Template; `{minutes}` is replaced with the minutes remaining
    pub closing_soon_message: String,
}

impl ScheduleGate {
    /// Evaluate the gate at an instant
    #[must_use]
    pub fn evaluate(&self, now: DateTime<Utc>) -> GateStatus {
        let local = now.with_timezone(&self.offset);
        #[allow(clippy::cast_possible_truncation)]
        let minute = (local.hour() * 60 + local.minute()) as u16;

        match self.schedule.minutes_until_close(local.weekday(), minute) {
            None => GateStatus::Closed {
                message: self.closed_message.clone(),
            },
            Some(remaining) if remaining <= self.warning_minutes => GateStatus::ClosingSoon {
                minutes_remaining: remaining,
                message: self
                    .closing_soon_message
                    .replace("{minutes}", &remaining.to_string()),
            },
            Some(_) => GateStatus::Open,
        }
    }
}
