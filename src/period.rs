//! Interpolation and aggregation periods.
//!
//! A period is the half-open interval `[start, end)` obtained by truncating a
//! reference instant to the period granularity.

use crate::error::PipelineError;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Hourly,
    Daily,
}

impl PeriodKind {
    pub fn identifier(&self) -> &'static str {
        match self {
            PeriodKind::Hourly => "hourly",
            PeriodKind::Daily => "daily",
        }
    }

    pub fn step(&self) -> TimeDelta {
        match self {
            PeriodKind::Hourly => TimeDelta::hours(1),
            PeriodKind::Daily => TimeDelta::days(1),
        }
    }

    pub fn truncate(&self, instant: NaiveDateTime) -> NaiveDateTime {
        let midnight = instant.date().and_time(NaiveTime::MIN);
        match self {
            PeriodKind::Hourly => midnight + TimeDelta::hours(i64::from(instant.hour())),
            PeriodKind::Daily => midnight,
        }
    }
}

impl FromStr for PeriodKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(PeriodKind::Hourly),
            "daily" => Ok(PeriodKind::Daily),
            other => Err(PipelineError::Config(format!("unknown period {:?}", other))),
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub kind: PeriodKind,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Period {
    pub fn containing(kind: PeriodKind, instant: NaiveDateTime) -> Self {
        let start = kind.truncate(instant);
        Self { kind, start, end: start + kind.step() }
    }

    /// The most recent period that ended at or before `now`.
    pub fn last_completed(kind: PeriodKind, now: NaiveDateTime) -> Self {
        Self::containing(kind, now - kind.step())
    }

    /// Parse operator input: `YYYY-MM-DD HH` for hourly, `YYYY-MM-DD` for daily.
    pub fn parse(kind: PeriodKind, text: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::Config(format!("invalid {} period {:?}", kind, text));
        let text = text.trim();
        let instant = match kind {
            PeriodKind::Daily => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|_| invalid())?
                .and_time(NaiveTime::MIN),
            PeriodKind::Hourly => {
                let (date, hour) = text.split_once(' ').ok_or_else(invalid)?;
                let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
                let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
                let time = NaiveTime::from_hms_opt(hour, 0, 0).ok_or_else(invalid)?;
                date.and_time(time)
            }
        };
        Ok(Self::containing(kind, instant))
    }

    pub fn next(&self) -> Self {
        Self::containing(self.kind, self.end)
    }

    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} .. {})", self.kind, self.start, self.end)
    }
}
