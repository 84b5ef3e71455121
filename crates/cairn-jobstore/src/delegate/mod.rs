//! Row-level persistence of jobs, triggers and their bookkeeping tables.
//!
//! The engine never issues SQL itself: every read and write goes through a
//! [`StoreDelegate`] bound to the connection of the current unit of work.

pub mod registry;
pub mod sqlite;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::calendar::Calendar;
use crate::error::Result;
use crate::types::{
    FiredTriggerRecord, JobDataMap, JobDetail, Key, SchedulerStateRecord, Trigger, TriggerState,
};

pub use registry::{ScheduleCodec, ScheduleRegistry};
pub use sqlite::SqliteDelegate;

/// Storage operations for one backend dialect.
///
/// State updates that take "old" states are compare-and-swap: they only
/// touch rows currently in one of those states and return the row count.
pub trait StoreDelegate: Send + Sync {
    // --- jobs --------------------------------------------------------------

    fn insert_job_detail(&self, conn: &Connection, job: &JobDetail) -> Result<()>;
    fn update_job_detail(&self, conn: &Connection, job: &JobDetail) -> Result<usize>;
    fn delete_job_detail(&self, conn: &Connection, key: &Key) -> Result<usize>;
    fn select_job_detail(&self, conn: &Connection, key: &Key) -> Result<Option<JobDetail>>;
    fn job_exists(&self, conn: &Connection, key: &Key) -> Result<bool>;
    fn update_job_data(&self, conn: &Connection, job: &JobDetail) -> Result<usize>;
    fn select_number_of_jobs(&self, conn: &Connection) -> Result<usize>;
    /// All job keys, or only those of `group`.
    fn select_job_keys(&self, conn: &Connection, group: Option<&str>) -> Result<Vec<Key>>;

    // --- triggers ----------------------------------------------------------

    fn insert_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()>;
    fn update_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<usize>;
    fn delete_trigger(&self, conn: &Connection, key: &Key) -> Result<usize>;
    fn trigger_exists(&self, conn: &Connection, key: &Key) -> Result<bool>;
    fn select_trigger(&self, conn: &Connection, key: &Key) -> Result<Option<Trigger>>;
    fn select_trigger_state(&self, conn: &Connection, key: &Key) -> Result<Option<TriggerState>>;
    fn select_job_key_for_trigger(&self, conn: &Connection, key: &Key) -> Result<Option<Key>>;
    fn select_trigger_job_data(&self, conn: &Connection, key: &Key)
        -> Result<Option<JobDataMap>>;
    fn select_triggers_for_job(&self, conn: &Connection, job_key: &Key) -> Result<Vec<Trigger>>;
    fn select_trigger_keys_for_job(&self, conn: &Connection, job_key: &Key) -> Result<Vec<Key>>;
    fn select_triggers_for_calendar(&self, conn: &Connection, name: &str) -> Result<Vec<Trigger>>;
    fn calendar_is_referenced(&self, conn: &Connection, name: &str) -> Result<bool>;
    /// All trigger keys, or only those of `group`.
    fn select_trigger_keys(&self, conn: &Connection, group: Option<&str>) -> Result<Vec<Key>>;
    fn select_trigger_group_names(&self, conn: &Connection) -> Result<Vec<String>>;
    fn select_number_of_triggers(&self, conn: &Connection) -> Result<usize>;
    fn select_number_of_triggers_for_job(&self, conn: &Connection, job_key: &Key)
        -> Result<usize>;
    fn select_triggers_in_state(&self, conn: &Connection, state: TriggerState)
        -> Result<Vec<Key>>;

    fn update_trigger_state(
        &self,
        conn: &Connection,
        key: &Key,
        state: TriggerState,
    ) -> Result<usize>;
    fn update_trigger_state_from_other_states(
        &self,
        conn: &Connection,
        key: &Key,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize>;
    fn update_trigger_state_from_other_state(
        &self,
        conn: &Connection,
        key: &Key,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<usize> {
        self.update_trigger_state_from_other_states(conn, key, new_state, &[old_state])
    }
    fn update_trigger_states_for_job(
        &self,
        conn: &Connection,
        job_key: &Key,
        state: TriggerState,
    ) -> Result<usize>;
    fn update_trigger_states_for_job_from_other_state(
        &self,
        conn: &Connection,
        job_key: &Key,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<usize>;
    fn update_trigger_group_state_from_other_states(
        &self,
        conn: &Connection,
        group: &str,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize>;
    /// Every trigger of this scheduler currently in one of `old_states`.
    fn update_trigger_states_from_other_states(
        &self,
        conn: &Connection,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize>;

    /// Keys of triggers in `state` whose fire time is before `misfire_time`
    /// (ignoring the ignore-misfire policy), earliest first then priority.
    /// With a limit, the flag reports whether more rows remain.
    fn select_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<(Vec<Key>, bool)>;
    fn count_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
    ) -> Result<usize>;
    /// WAITING triggers due no later than `no_later_than`, skipping misfired
    /// ones (fire time before `no_earlier_than`) unless they ignore misfires.
    fn select_triggers_to_acquire(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Key>>;

    // --- fired triggers ----------------------------------------------------

    fn insert_fired_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
        job: Option<&JobDetail>,
        instance_id: &str,
    ) -> Result<()>;
    fn update_fired_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
        job: Option<&JobDetail>,
        instance_id: &str,
    ) -> Result<usize>;
    fn select_fired_triggers_for_trigger(
        &self,
        conn: &Connection,
        key: &Key,
    ) -> Result<Vec<FiredTriggerRecord>>;
    fn select_fired_triggers_for_job(
        &self,
        conn: &Connection,
        job_key: &Key,
    ) -> Result<Vec<FiredTriggerRecord>>;
    fn select_instance_fired_triggers(
        &self,
        conn: &Connection,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>>;
    fn select_fired_trigger_instance_names(&self, conn: &Connection) -> Result<HashSet<String>>;
    fn delete_fired_trigger(&self, conn: &Connection, fire_instance_id: &str) -> Result<usize>;
    fn delete_instance_fired_triggers(&self, conn: &Connection, instance_id: &str)
        -> Result<usize>;
    fn delete_fired_triggers(&self, conn: &Connection) -> Result<usize>;

    // --- calendars ---------------------------------------------------------

    fn insert_calendar(&self, conn: &Connection, name: &str, calendar: &Calendar) -> Result<()>;
    fn update_calendar(&self, conn: &Connection, name: &str, calendar: &Calendar)
        -> Result<usize>;
    fn calendar_exists(&self, conn: &Connection, name: &str) -> Result<bool>;
    fn select_calendar(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>>;
    fn delete_calendar(&self, conn: &Connection, name: &str) -> Result<usize>;
    fn select_number_of_calendars(&self, conn: &Connection) -> Result<usize>;
    fn select_calendar_names(&self, conn: &Connection) -> Result<Vec<String>>;

    // --- paused groups -----------------------------------------------------

    fn insert_paused_trigger_group(&self, conn: &Connection, group: &str) -> Result<()>;
    fn delete_paused_trigger_group(&self, conn: &Connection, group: &str) -> Result<usize>;
    fn is_trigger_group_paused(&self, conn: &Connection, group: &str) -> Result<bool>;
    fn select_paused_trigger_groups(&self, conn: &Connection) -> Result<HashSet<String>>;

    // --- scheduler state ---------------------------------------------------

    fn insert_scheduler_state(
        &self,
        conn: &Connection,
        instance_id: &str,
        checkin: DateTime<Utc>,
        interval_ms: i64,
    ) -> Result<()>;
    fn update_scheduler_state(
        &self,
        conn: &Connection,
        instance_id: &str,
        checkin: DateTime<Utc>,
    ) -> Result<usize>;
    fn delete_scheduler_state(&self, conn: &Connection, instance_id: &str) -> Result<usize>;
    /// All records, or only the one for `instance_id`.
    fn select_scheduler_state_records(
        &self,
        conn: &Connection,
        instance_id: Option<&str>,
    ) -> Result<Vec<SchedulerStateRecord>>;

    /// Delete every row belonging to this scheduler.
    fn clear_data(&self, conn: &Connection) -> Result<()>;
}
