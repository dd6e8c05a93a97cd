use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::LeadflowError;

/// Upper bound on day hops while searching for an allowed slot.
const MAX_DAY_HOPS: usize = 14;

/// Weekdays and hour range during which a step may be sent, evaluated in a
/// fixed UTC offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<Weekday>,

    /// First allowed hour (inclusive).
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,

    /// First disallowed hour (exclusive); 24 allows the rest of the day.
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,

    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_weekdays() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    17
}

impl Default for DeliveryWindow {
    fn default() -> Self {
        Self {
            weekdays: default_weekdays(),
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            utc_offset_minutes: 0,
        }
    }
}

impl DeliveryWindow {
    pub fn validate(&self) -> Result<(), LeadflowError> {
        if self.weekdays.is_empty() {
            return Err(LeadflowError::Validation(
                "delivery window needs at least one weekday".into(),
            ));
        }
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(LeadflowError::Validation(format!(
                "delivery window hours {}..{} are not a valid range",
                self.start_hour, self.end_hour
            )));
        }
        if self.offset().is_none() {
            return Err(LeadflowError::Validation(format!(
                "utc offset of {} minutes is out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn allows_weekday(&self, day: Weekday) -> bool {
        self.weekdays.contains(&day)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        match self.offset() {
            Some(offset) => {
                let local = t.with_timezone(&offset);
                self.allows_weekday(local.weekday())
                    && local.hour() >= self.start_hour
                    && local.hour() < self.end_hour
            }
            None => true,
        }
    }

    /// Moves `t` forward to the earliest instant inside the window.
    ///
    /// Disallowed weekdays jump to the next local midnight; hours before the
    /// window clamp to its start; hours at or after its end jump to the next
    /// midnight and the checks repeat. A timestamp already inside the window
    /// is returned unchanged, so applying this twice equals applying it once.
    pub fn adjust(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if self.validate().is_err() {
            return t;
        }
        let Some(offset) = self.offset() else {
            return t;
        };

        let mut local = t.with_timezone(&offset);
        for _ in 0..MAX_DAY_HOPS {
            if !self.allows_weekday(local.weekday()) {
                local = local_at(next_day(local.date_naive()), 0, offset);
                continue;
            }
            if local.hour() < self.start_hour {
                local = local_at(local.date_naive(), self.start_hour, offset);
                break;
            }
            if local.hour() >= self.end_hour {
                local = local_at(next_day(local.date_naive()), 0, offset);
                continue;
            }
            break;
        }
        local.with_timezone(&Utc)
    }

    /// Window start on the local day after `t`, adjusted forward to an
    /// allowed weekday.
    pub fn next_day_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.offset() {
            Some(offset) => {
                let local = t.with_timezone(&offset);
                self.adjust(local_at(next_day(local.date_naive()), 0, offset).with_timezone(&Utc))
            }
            None => t,
        }
    }

    /// Start of the local day containing `t`, as a UTC instant.
    pub fn local_day_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.offset() {
            Some(offset) => {
                local_at(t.with_timezone(&offset).date_naive(), 0, offset).with_timezone(&Utc)
            }
            None => t,
        }
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn local_at(date: NaiveDate, hour: u32, offset: FixedOffset) -> DateTime<FixedOffset> {
    let local = date.and_time(NaiveTime::MIN) + TimeDelta::hours(i64::from(hour));
    let utc = local - TimeDelta::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, offset)
}
