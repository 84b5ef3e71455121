use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{JobStoreError, Result};
use crate::types::Schedule;

/// Persists the extended properties of one schedule type.
pub trait ScheduleCodec: Send + Sync {
    /// Value stored in the `TRIGGER_TYPE` column.
    fn discriminator(&self) -> &'static str;

    fn encode(&self, schedule: &Schedule) -> Result<String>;

    fn decode(&self, props: &str) -> Result<Schedule>;
}

/// Maps trigger-type discriminators to their codecs. Populated at start-up.
pub struct ScheduleRegistry {
    codecs: HashMap<&'static str, Box<dyn ScheduleCodec>>,
}

impl ScheduleRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in `SIMPLE`, `DAILY` and `WEEKLY` codecs.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(SimpleCodec));
        registry.register(Box::new(DailyCodec));
        registry.register(Box::new(WeeklyCodec));
        registry
    }

    /// Add a codec, replacing any previous one with the same discriminator.
    pub fn register(&mut self, codec: Box<dyn ScheduleCodec>) {
        self.codecs.insert(codec.discriminator(), codec);
    }

    /// Encode `schedule`, returning `(discriminator, properties)`.
    pub fn encode(&self, schedule: &Schedule) -> Result<(&'static str, String)> {
        let codec = self.codec(schedule.kind())?;
        Ok((codec.discriminator(), codec.encode(schedule)?))
    }

    pub fn decode(&self, discriminator: &str, props: &str) -> Result<Schedule> {
        self.codec(discriminator)?.decode(props)
    }

    fn codec(&self, discriminator: &str) -> Result<&dyn ScheduleCodec> {
        self.codecs
            .get(discriminator)
            .map(|c| c.as_ref())
            .ok_or_else(|| {
                JobStoreError::InvalidSchedule(format!(
                    "no codec registered for trigger type '{discriminator}'"
                ))
            })
    }
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Serialize, Deserialize)]
struct SimpleProps {
    repeat_interval_ms: i64,
    repeat_count: i32,
    times_triggered: i32,
}

#[derive(Serialize, Deserialize)]
struct WallClockProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    day: Option<u8>,
    hour: u8,
    minute: u8,
}

fn mismatch(expected: &str, got: &Schedule) -> JobStoreError {
    JobStoreError::InvalidSchedule(format!(
        "{expected} codec cannot encode a {} schedule",
        got.kind()
    ))
}

struct SimpleCodec;

impl ScheduleCodec for SimpleCodec {
    fn discriminator(&self) -> &'static str {
        "SIMPLE"
    }

    fn encode(&self, schedule: &Schedule) -> Result<String> {
        match schedule {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
                times_triggered,
            } => Ok(serde_json::to_string(&SimpleProps {
                repeat_interval_ms: *repeat_interval_ms,
                repeat_count: *repeat_count,
                times_triggered: *times_triggered,
            })?),
            other => Err(mismatch(self.discriminator(), other)),
        }
    }

    fn decode(&self, props: &str) -> Result<Schedule> {
        let p: SimpleProps = serde_json::from_str(props)?;
        Ok(Schedule::Simple {
            repeat_interval_ms: p.repeat_interval_ms,
            repeat_count: p.repeat_count,
            times_triggered: p.times_triggered,
        })
    }
}

struct DailyCodec;

impl ScheduleCodec for DailyCodec {
    fn discriminator(&self) -> &'static str {
        "DAILY"
    }

    fn encode(&self, schedule: &Schedule) -> Result<String> {
        match schedule {
            Schedule::Daily { hour, minute } => Ok(serde_json::to_string(&WallClockProps {
                day: None,
                hour: *hour,
                minute: *minute,
            })?),
            other => Err(mismatch(self.discriminator(), other)),
        }
    }

    fn decode(&self, props: &str) -> Result<Schedule> {
        let p: WallClockProps = serde_json::from_str(props)?;
        Ok(Schedule::Daily {
            hour: p.hour,
            minute: p.minute,
        })
    }
}

struct WeeklyCodec;

impl ScheduleCodec for WeeklyCodec {
    fn discriminator(&self) -> &'static str {
        "WEEKLY"
    }

    fn encode(&self, schedule: &Schedule) -> Result<String> {
        match schedule {
            Schedule::Weekly { day, hour, minute } => Ok(serde_json::to_string(&WallClockProps {
                day: Some(*day),
                hour: *hour,
                minute: *minute,
            })?),
            other => Err(mismatch(self.discriminator(), other)),
        }
    }

    fn decode(&self, props: &str) -> Result<Schedule> {
        let p: WallClockProps = serde_json::from_str(props)?;
        let day = p
            .day
            .ok_or_else(|| JobStoreError::InvalidSchedule("weekly schedule without a day".into()))?;
        Ok(Schedule::Weekly {
            day,
            hour: p.hour,
            minute: p.minute,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekly_props_keep_the_day() {
        let registry = ScheduleRegistry::standard();
        let schedule = Schedule::Weekly {
            day: 4,
            hour: 18,
            minute: 15,
        };
        let (kind, props) = registry.encode(&schedule).unwrap();
        assert_eq!(kind, "WEEKLY");
        assert_eq!(registry.decode(kind, &props).unwrap(), schedule);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let registry = ScheduleRegistry::standard();
        let err = registry.decode("CRON", "{}").unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn empty_registry_cannot_encode() {
        let registry = ScheduleRegistry::empty();
        assert!(registry.encode(&Schedule::once()).is_err());
    }

    #[test]
    fn weekly_without_day_is_invalid() {
        let registry = ScheduleRegistry::standard();
        assert!(registry
            .decode("WEEKLY", r#"{"hour":1,"minute":2}"#)
            .is_err());
    }
}
