use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Exclusion calendar: fire times falling inside an excluded slot are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default)]
    pub description: Option<String>,
    /// Whole UTC days that never fire.
    #[serde(default)]
    pub excluded_dates: BTreeSet<NaiveDate>,
    /// 0 = Monday … 6 = Sunday.
    #[serde(default)]
    pub excluded_weekdays: BTreeSet<u8>,
    /// Daily window `[start_hour, end_hour)` (UTC) that never fires.
    #[serde(default)]
    pub excluded_hours: Option<(u8, u8)>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_date(mut self, date: NaiveDate) -> Self {
        self.excluded_dates.insert(date);
        self
    }

    pub fn exclude_weekday(mut self, day: u8) -> Self {
        self.excluded_weekdays.insert(day.min(6));
        self
    }

    pub fn exclude_hours(mut self, start_hour: u8, end_hour: u8) -> Self {
        self.excluded_hours = Some((start_hour.min(24), end_hour.min(24)));
        self
    }

    pub fn is_time_included(&self, t: DateTime<Utc>) -> bool {
        !self.day_excluded(t) && !self.hour_excluded(t)
    }

    /// Earliest included instant at or after `t`.
    pub fn next_included_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = t;
        // A week plus every excluded date bounds how many days can be skipped.
        let max_steps = 8 + self.excluded_dates.len() * 2;
        for _ in 0..max_steps {
            if self.day_excluded(candidate) {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if self.hour_excluded(candidate) {
                candidate = self.end_of_excluded_hours(candidate);
                continue;
            }
            return candidate;
        }
        candidate
    }

    fn day_excluded(&self, t: DateTime<Utc>) -> bool {
        let weekday = t.weekday().num_days_from_monday() as u8;
        self.excluded_weekdays.contains(&weekday) || self.excluded_dates.contains(&t.date_naive())
    }

    fn hour_excluded(&self, t: DateTime<Utc>) -> bool {
        match self.excluded_hours {
            Some((start, end)) if start < end => {
                let hour = t.hour() as u8;
                hour >= start && hour < end
            }
            _ => false,
        }
    }

    fn end_of_excluded_hours(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let end = self.excluded_hours.map(|(_, end)| end).unwrap_or(0);
        if end >= 24 {
            return start_of_next_day(t);
        }
        Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), end as u32, 0, 0)
            .single()
            .unwrap_or_else(|| start_of_next_day(t))
    }
}

fn start_of_next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let next = t.date_naive() + Duration::days(1);
    next.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(t + Duration::days(1))
}
