use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::calendar::Calendar;

pub const DEFAULT_GROUP: &str = "DEFAULT";
/// Group holding the one-shot triggers synthesized for interrupted jobs.
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";
/// Paused-group marker meaning "every group, including ones created later".
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";
pub const DEFAULT_PRIORITY: i32 = 5;

// Data-map keys written into recovery triggers.
pub const FAILED_JOB_ORIGINAL_TRIGGER_NAME: &str = "CAIRN_FAILED_JOB_ORIG_TRIGGER_NAME";
pub const FAILED_JOB_ORIGINAL_TRIGGER_GROUP: &str = "CAIRN_FAILED_JOB_ORIG_TRIGGER_GROUP";
pub const FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS: &str =
    "CAIRN_FAILED_JOB_ORIG_TRIGGER_FIRETIME_IN_MILLISECONDS_AS_STRING";
pub const FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS: &str =
    "CAIRN_FAILED_JOB_ORIG_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS_AS_STRING";

/// Identity of a job or trigger: unique name within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub group: String,
}

impl Key {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the `DEFAULT` group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Persisted trigger state. `Deleted` is never stored: it is what a missing
/// row reads as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Blocked,
    Error,
    Paused,
    PausedBlocked,
    Deleted,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Error => "ERROR",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "EXECUTING" => Ok(TriggerState::Executing),
            "COMPLETE" => Ok(TriggerState::Complete),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "ERROR" => Ok(TriggerState::Error),
            "PAUSED" => Ok(TriggerState::Paused),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            "DELETED" => Ok(TriggerState::Deleted),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// What to do with a trigger whose fire time passed by more than the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Pick a sensible policy for the schedule type.
    #[default]
    Smart,
    /// Never treated as misfired; fires late for every missed time.
    IgnoreMisfirePolicy,
    /// Fire once, immediately.
    FireNow,
    /// Skip missed fires and wait for the next scheduled time after now.
    DoNothing,
}

impl MisfireInstruction {
    /// Integer stored in `MISFIRE_INSTR`; `-1` is the ignore policy.
    pub fn code(&self) -> i32 {
        match self {
            MisfireInstruction::IgnoreMisfirePolicy => -1,
            MisfireInstruction::Smart => 0,
            MisfireInstruction::FireNow => 1,
            MisfireInstruction::DoNothing => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(MisfireInstruction::IgnoreMisfirePolicy),
            0 => Some(MisfireInstruction::Smart),
            1 => Some(MisfireInstruction::FireNow),
            2 => Some(MisfireInstruction::DoNothing),
            _ => None,
        }
    }
}

/// Outcome reported by the caller when a fired job finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    NoInstruction,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

/// Opaque key/value payload attached to jobs and triggers.
///
/// Tracks whether it was modified so completion only writes back changed data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct JobDataMap {
    entries: Map<String, Value>,
    dirty: bool,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }
}

impl PartialEq for JobDataMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl From<Map<String, Value>> for JobDataMap {
    fn from(entries: Map<String, Value>) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }
}

impl From<JobDataMap> for Map<String, Value> {
    fn from(map: JobDataMap) -> Self {
        map.entries
    }
}

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: Key,
    pub description: Option<String>,
    /// Name the scheduler resolves to an executable job implementation.
    pub job_class: String,
    /// Kept even when no trigger references it.
    pub durable: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_data_after_execution: bool,
    /// Re-run the job if its instance dies mid-execution.
    pub requests_recovery: bool,
    pub job_data: JobDataMap,
}

impl JobDetail {
    pub fn new(key: Key, job_class: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            job_class: job_class.into(),
            durable: false,
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
            requests_recovery: false,
            job_data: JobDataMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_concurrent_execution_disallowed(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    pub fn with_persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    pub fn with_requests_recovery(mut self, recovery: bool) -> Self {
        self.requests_recovery = recovery;
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.job_data = data;
        self.job_data.clear_dirty();
        self
    }
}

/// Defines when and how often a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire at `start_time`, then every `repeat_interval_ms`.
    /// `repeat_count` of `-1` repeats forever, `0` fires once.
    Simple {
        repeat_interval_ms: i64,
        repeat_count: i32,
        times_triggered: i32,
    },

    /// Fire every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Fire on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

impl Schedule {
    pub fn once() -> Self {
        Schedule::Simple {
            repeat_interval_ms: 0,
            repeat_count: 0,
            times_triggered: 0,
        }
    }

    pub fn every(interval: chrono::Duration, repeat_count: i32) -> Self {
        Schedule::Simple {
            repeat_interval_ms: interval.num_milliseconds(),
            repeat_count,
            times_triggered: 0,
        }
    }

    /// Discriminator the schedule registry stores in `TRIGGER_TYPE`.
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Simple { .. } => "SIMPLE",
            Schedule::Daily { .. } => "DAILY",
            Schedule::Weekly { .. } => "WEEKLY",
        }
    }
}

/// A schedule bound to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: Key,
    pub job_key: Key,
    pub description: Option<String>,
    /// Higher fires first when fire times tie.
    pub priority: i32,
    pub schedule: Schedule,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub misfire_instruction: MisfireInstruction,
    pub calendar_name: Option<String>,
    pub job_data: JobDataMap,
    /// Set while acquired; identifies the fired-trigger record.
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    /// Build a trigger and compute its first fire time (no calendar).
    pub fn new(key: Key, job_key: Key, schedule: Schedule, start_time: DateTime<Utc>) -> Self {
        let mut trigger = Self {
            key,
            job_key,
            description: None,
            priority: DEFAULT_PRIORITY,
            schedule,
            start_time: to_millis_precision(start_time),
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            misfire_instruction: MisfireInstruction::Smart,
            calendar_name: None,
            job_data: JobDataMap::new(),
            fire_instance_id: None,
        };
        trigger.compute_first_fire_time(None);
        trigger
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    /// Attach a calendar and recompute the first fire time against it.
    pub fn with_calendar(mut self, name: impl Into<String>, calendar: &Calendar) -> Self {
        self.calendar_name = Some(name.into());
        self.compute_first_fire_time(Some(calendar));
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(to_millis_precision(end_time));
        self.compute_first_fire_time(None);
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.job_data = data;
        self
    }

    /// Instruction the scheduler reports back once a fire finishes normally.
    pub fn execution_complete(&self) -> CompletedExecutionInstruction {
        if self.next_fire_time.is_none() {
            CompletedExecutionInstruction::DeleteTrigger
        } else {
            CompletedExecutionInstruction::NoInstruction
        }
    }
}

/// In-flight fire of a trigger, kept until completion or release.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub trigger_key: Key,
    /// Unknown until the trigger is actually fired.
    pub job_key: Option<Key>,
    pub instance_id: String,
    pub fired_timestamp: DateTime<Utc>,
    pub scheduled_timestamp: DateTime<Utc>,
    pub priority: i32,
    pub state: TriggerState,
    pub job_disallows_concurrent_execution: bool,
    pub job_requests_recovery: bool,
}

/// Heartbeat row of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub checkin_timestamp: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

/// Everything the scheduler needs to run a fired trigger.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    /// The trigger was synthesized to re-run an interrupted job.
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Per-trigger outcome of `triggers_fired`: a bundle, nothing (trigger no
/// longer fireable), or that trigger's own error.
pub type TriggerFiredResult = std::result::Result<Option<TriggerFiredBundle>, crate::JobStoreError>;

/// Times are persisted as epoch milliseconds, so in-memory values are kept at
/// the same precision.
pub fn to_millis_precision(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
