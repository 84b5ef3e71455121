use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::calendar::Calendar;
use crate::types::{to_millis_precision, MisfireInstruction, Schedule, Trigger};

/// Fire times beyond this year are treated as "never".
const YEAR_TO_GIVEUP_SCHEDULING_AT: i32 = 2299;

/// Compute the next UTC wall-clock slot for a `Daily` / `Weekly` schedule
/// strictly *after* `from`.
fn next_wall_clock_slot(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Daily { hour, minute } => {
            // Build today's candidate at HH:MM:00 UTC.
            let candidate = Utc
                .with_ymd_and_hms(
                    from.year(),
                    from.month(),
                    from.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            // `day` follows ISO weekday numbering: 0=Monday … 6=Sunday,
            // which matches chrono's `num_days_from_monday`.
            let today_dow = from.weekday().num_days_from_monday() as i64;
            let target_dow = (*day as i64).clamp(0, 6);
            let days_ahead = (target_dow - today_dow).rem_euclid(7);
            let candidate_day = from + Duration::days(days_ahead);

            let candidate = Utc
                .with_ymd_and_hms(
                    candidate_day.year(),
                    candidate_day.month(),
                    candidate_day.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;

            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }

        Schedule::Simple { .. } => None,
    }
}

impl Trigger {
    /// Next time this trigger's schedule would fire strictly after `after`,
    /// ignoring calendars.
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match &self.schedule {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
                ..
            } => {
                if after < self.start_time {
                    Some(self.start_time)
                } else if *repeat_count == 0 || *repeat_interval_ms <= 0 {
                    None
                } else {
                    let elapsed = (after - self.start_time).num_milliseconds();
                    let times = elapsed / repeat_interval_ms + 1;
                    if *repeat_count >= 0 && times > *repeat_count as i64 {
                        None
                    } else {
                        Some(self.start_time + Duration::milliseconds(times * repeat_interval_ms))
                    }
                }
            }
            wall_clock => {
                let from = if after < self.start_time {
                    self.start_time - Duration::milliseconds(1)
                } else {
                    after
                };
                next_wall_clock_slot(wall_clock, from)
            }
        }?;

        match self.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    /// Like [`Trigger::fire_time_after`] but skipping slots the calendar excludes.
    fn included_fire_time_after(
        &self,
        after: DateTime<Utc>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let mut next = self.fire_time_after(after)?;
        let Some(cal) = calendar else {
            return Some(next);
        };
        while !cal.is_time_included(next) {
            let skip_to = cal.next_included_time(next) - Duration::milliseconds(1);
            next = self.fire_time_after(skip_to.max(next))?;
            if next.year() > YEAR_TO_GIVEUP_SCHEDULING_AT {
                return None;
            }
        }
        Some(next)
    }

    /// Set `next_fire_time` to the first fire at or after `start_time`.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let before_start = self.start_time - Duration::milliseconds(1);
        self.next_fire_time = self.included_fire_time_after(before_start, calendar);
        self.next_fire_time
    }

    /// Advance the schedule after a fire.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        if let Schedule::Simple {
            times_triggered, ..
        } = &mut self.schedule
        {
            *times_triggered += 1;
        }
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = self
            .next_fire_time
            .and_then(|fired| self.included_fire_time_after(fired, calendar));
    }

    /// Apply the misfire instruction, recomputing `next_fire_time` relative to `now`.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        let now = to_millis_precision(now);
        let instruction = match self.misfire_instruction {
            MisfireInstruction::IgnoreMisfirePolicy => return,
            MisfireInstruction::Smart => match &self.schedule {
                Schedule::Simple { repeat_count, .. } if *repeat_count != 0 => {
                    MisfireInstruction::DoNothing
                }
                _ => MisfireInstruction::FireNow,
            },
            other => other,
        };

        match instruction {
            MisfireInstruction::FireNow => {
                let due = match calendar {
                    Some(cal) if !cal.is_time_included(now) => cal.next_included_time(now),
                    _ => now,
                };
                self.next_fire_time = match self.end_time {
                    Some(end) if due > end => None,
                    _ => Some(due),
                };
            }
            _ => {
                self.next_fire_time = self.included_fire_time_after(now, calendar);
            }
        }
    }

    /// Recompute the next fire time after the referenced calendar changed.
    pub fn update_with_new_calendar(
        &mut self,
        calendar: Option<&Calendar>,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let after = self
            .previous_fire_time
            .unwrap_or(self.start_time - Duration::milliseconds(1));
        let mut next = self.included_fire_time_after(after, calendar);
        if let Some(t) = next {
            if t < now && now - t >= misfire_threshold {
                next = self.included_fire_time_after(now, calendar);
            }
        }
        self.next_fire_time = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Key;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn trigger(schedule: Schedule, start: DateTime<Utc>) -> Trigger {
        Trigger::new(Key::named("t"), Key::named("j"), schedule, start)
    }

    #[test]
    fn one_shot_fires_once_at_start() {
        let start = at(2026, 5, 1, 10, 0);
        let mut t = trigger(Schedule::once(), start);
        assert_eq!(t.next_fire_time, Some(start));
        t.triggered(None);
        assert_eq!(t.previous_fire_time, Some(start));
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn repeat_count_limits_fires() {
        let start = at(2026, 5, 1, 10, 0);
        let mut t = trigger(Schedule::every(Duration::minutes(5), 2), start);
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(2026, 5, 1, 10, 5)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(2026, 5, 1, 10, 10)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, None);
        assert!(matches!(
            t.schedule,
            Schedule::Simple {
                times_triggered: 3,
                ..
            }
        ));
    }

    #[test]
    fn end_time_stops_repeats() {
        let start = at(2026, 5, 1, 10, 0);
        let mut t = trigger(Schedule::every(Duration::hours(1), -1), start)
            .with_end_time(at(2026, 5, 1, 11, 30));
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(at(2026, 5, 1, 11, 0)));
        t.triggered(None);
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn daily_same_day_future() {
        let t = trigger(
            Schedule::Daily {
                hour: 14,
                minute: 30,
            },
            at(2026, 3, 4, 9, 0),
        );
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 4, 14, 30)));
    }

    #[test]
    fn daily_already_passed_rolls_to_tomorrow() {
        let t = trigger(Schedule::Daily { hour: 8, minute: 0 }, at(2026, 3, 4, 9, 0));
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 5, 8, 0)));
    }

    #[test]
    fn weekly_targets_requested_weekday() {
        // 2026-03-04 is a Wednesday; Monday = 0.
        let t = trigger(
            Schedule::Weekly {
                day: 0,
                hour: 9,
                minute: 0,
            },
            at(2026, 3, 4, 12, 0),
        );
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 9, 9, 0)));
    }

    #[test]
    fn calendar_skips_excluded_days() {
        // 2026-03-07 is a Saturday.
        let cal = Calendar::new().exclude_weekday(5).exclude_weekday(6);
        let t = trigger(Schedule::Daily { hour: 6, minute: 0 }, at(2026, 3, 6, 12, 0))
            .with_calendar("weekdays", &cal);
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 9, 6, 0)));
    }

    #[test]
    fn smart_misfire_of_one_shot_fires_now() {
        let now = at(2026, 5, 1, 12, 0);
        let mut t = trigger(Schedule::once(), now - Duration::minutes(2));
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn smart_misfire_of_repeating_skips_to_future() {
        let now = at(2026, 5, 1, 12, 0);
        let start = now - Duration::minutes(7);
        let mut t = trigger(Schedule::every(Duration::minutes(5), -1), start);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(start + Duration::minutes(10)));
    }

    #[test]
    fn do_nothing_on_exhausted_schedule_completes() {
        let now = at(2026, 5, 1, 12, 0);
        let mut t = trigger(Schedule::once(), now - Duration::minutes(2))
            .with_misfire_instruction(MisfireInstruction::DoNothing);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn ignore_policy_leaves_trigger_untouched() {
        let now = at(2026, 5, 1, 12, 0);
        let start = now - Duration::minutes(2);
        let mut t = trigger(Schedule::once(), start)
            .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(start));
    }

    #[test]
    fn new_calendar_moves_next_fire() {
        let start = at(2026, 3, 6, 12, 0);
        let mut t = trigger(Schedule::Daily { hour: 6, minute: 0 }, start);
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 7, 6, 0)));
        let cal = Calendar::new().exclude_weekday(5);
        t.update_with_new_calendar(Some(&cal), Duration::minutes(1), start);
        assert_eq!(t.next_fire_time, Some(at(2026, 3, 8, 6, 0)));
    }
}
