//! Schedule buckets and the tick windows they are matched against.
//!
//! Interval buckets (`every_5m`, `every_2h`, `every_1d`) fire on multiples of
//! their interval counted in local time; time-of-day buckets (`midnight`,
//! `5am`, `noon`, `11pm`) fire on the hour. `never` only runs through
//! `receive`.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::ScheduleError;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn secs(&self) -> i64 {
        match self {
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => SECS_PER_DAY,
        }
    }

    fn suffix(&self) -> char {
        match self {
            IntervalUnit::Minutes => 'm',
            IntervalUnit::Hours => 'h',
            IntervalUnit::Days => 'd',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    Every { amount: u32, unit: IntervalUnit },
    Daily { hour: u8 },
    Never,
}

impl Schedule {
    pub fn every_minutes(amount: u32) -> Self {
        Schedule::Every {
            amount,
            unit: IntervalUnit::Minutes,
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Schedule::Never)
    }

    /// First boundary strictly after `after`, with local time shifted by
    /// `utc_offset_secs`.
    pub fn next_boundary_after(
        &self,
        after: DateTime<Utc>,
        utc_offset_secs: i64,
    ) -> Option<DateTime<Utc>> {
        let local = after.timestamp() + utc_offset_secs;
        let next_local = match self {
            Schedule::Every { amount, unit } => {
                let period = i64::from(*amount) * unit.secs();
                (local.div_euclid(period) + 1) * period
            }
            Schedule::Daily { hour } => {
                let day_start = local.div_euclid(SECS_PER_DAY) * SECS_PER_DAY;
                let candidate = day_start + i64::from(*hour) * 3_600;
                if candidate <= local {
                    candidate + SECS_PER_DAY
                } else {
                    candidate
                }
            }
            Schedule::Never => return None,
        };
        Utc.timestamp_opt(next_local - utc_offset_secs, 0).single()
    }

    pub fn is_due(&self, window: &TickWindow, utc_offset_secs: i64) -> bool {
        self.next_boundary_after(window.start, utc_offset_secs)
            .is_some_and(|boundary| boundary <= window.end)
    }
}

fn interval_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^every_(\d+)([mhd])$").expect("valid schedule regex"))
}

fn hour_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{1,2})(am|pm)$").expect("valid schedule regex"))
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "never" => return Ok(Schedule::Never),
            "midnight" => return Ok(Schedule::Daily { hour: 0 }),
            "noon" => return Ok(Schedule::Daily { hour: 12 }),
            _ => {}
        }

        if let Some(caps) = interval_pattern().captures(s) {
            let amount: u32 = caps[1]
                .parse()
                .map_err(|_| ScheduleError::Unknown(s.to_string()))?;
            if amount == 0 {
                return Err(ScheduleError::ZeroInterval(s.to_string()));
            }
            let unit = match &caps[2] {
                "m" => IntervalUnit::Minutes,
                "h" => IntervalUnit::Hours,
                _ => IntervalUnit::Days,
            };
            return Ok(Schedule::Every { amount, unit });
        }

        if let Some(caps) = hour_pattern().captures(s) {
            let hour: u8 = caps[1]
                .parse()
                .map_err(|_| ScheduleError::Unknown(s.to_string()))?;
            if !(1..=11).contains(&hour) {
                return Err(ScheduleError::Unknown(s.to_string()));
            }
            let hour = if &caps[2] == "pm" { hour + 12 } else { hour };
            return Ok(Schedule::Daily { hour });
        }

        Err(ScheduleError::Unknown(s.to_string()))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every { amount, unit } => write!(f, "every_{}{}", amount, unit.suffix()),
            Schedule::Daily { hour: 0 } => f.write_str("midnight"),
            Schedule::Daily { hour: 12 } => f.write_str("noon"),
            Schedule::Daily { hour } if *hour < 12 => write!(f, "{}am", hour),
            Schedule::Daily { hour } => write!(f, "{}pm", hour - 12),
            Schedule::Never => f.write_str("never"),
        }
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

/// The half-open span `(start, end]` covered by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TickWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of length `period` ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, period: std::time::Duration) -> Self {
        let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::minutes(1));
        Self {
            start: end - period,
            end,
        }
    }
}
