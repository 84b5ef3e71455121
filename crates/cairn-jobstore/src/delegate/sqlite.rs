use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::calendar::Calendar;
use crate::db::rtp;
use crate::delegate::{ScheduleRegistry, StoreDelegate};
use crate::error::{JobStoreError, Result};
use crate::types::{
    from_millis, to_millis, FiredTriggerRecord, JobDataMap, JobDetail, Key, MisfireInstruction,
    SchedulerStateRecord, Trigger, TriggerState,
};

const SELECT_JOB: &str = "SELECT JOB_NAME, JOB_GROUP, DESCRIPTION, JOB_CLASS_NAME, IS_DURABLE,
        IS_NONCONCURRENT, IS_UPDATE_DATA, REQUESTS_RECOVERY, JOB_DATA
     FROM {prefix}JOB_DETAILS WHERE SCHED_NAME = ?1";

const SELECT_TRIGGER: &str = "SELECT TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION,
        NEXT_FIRE_TIME, PREV_FIRE_TIME, PRIORITY, TRIGGER_TYPE, START_TIME, END_TIME,
        CALENDAR_NAME, MISFIRE_INSTR, JOB_DATA, SCHEDULE_PROPS
     FROM {prefix}TRIGGERS WHERE SCHED_NAME = ?1";

const SELECT_FIRED: &str = "SELECT ENTRY_ID, TRIGGER_NAME, TRIGGER_GROUP, INSTANCE_NAME, FIRED_TIME,
        SCHED_TIME, PRIORITY, STATE, JOB_NAME, JOB_GROUP, IS_NONCONCURRENT, REQUESTS_RECOVERY
     FROM {prefix}FIRED_TRIGGERS WHERE SCHED_NAME = ?1";

/// [`StoreDelegate`] for SQLite.
///
/// Statements are written against `{prefix}` table names and cached per
/// connection through `prepare_cached`.
pub struct SqliteDelegate {
    sched_name: String,
    prefix: String,
    registry: Arc<ScheduleRegistry>,
}

impl SqliteDelegate {
    pub fn new(
        sched_name: impl Into<String>,
        prefix: impl Into<String>,
        registry: Arc<ScheduleRegistry>,
    ) -> Self {
        Self {
            sched_name: sched_name.into(),
            prefix: prefix.into(),
            registry,
        }
    }

    fn sql(&self, template: &str) -> String {
        rtp(template, &self.prefix)
    }

    fn trigger_from_row(&self, raw: TriggerRow) -> Result<Trigger> {
        let schedule = self.registry.decode(&raw.kind, &raw.props)?;
        let misfire_instruction = MisfireInstruction::from_code(raw.misfire).ok_or_else(|| {
            JobStoreError::Persistence(format!(
                "trigger {} has unknown misfire instruction {}",
                raw.key, raw.misfire
            ))
        })?;
        Ok(Trigger {
            key: raw.key,
            job_key: raw.job_key,
            description: raw.description,
            priority: raw.priority,
            schedule,
            start_time: from_millis(raw.start),
            end_time: raw.end.map(from_millis),
            next_fire_time: raw.next.map(from_millis),
            previous_fire_time: raw.prev.map(from_millis),
            misfire_instruction,
            calendar_name: raw.calendar,
            job_data: serde_json::from_str(&raw.job_data)?,
            fire_instance_id: None,
        })
    }

    fn query_triggers(&self, conn: &Connection, sql: &str, args: &[Value]) -> Result<Vec<Trigger>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let raws = stmt
            .query_map(params_from_iter(args.iter()), row_to_trigger_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter()
            .map(|raw| self.trigger_from_row(raw))
            .collect()
    }

    fn query_keys(&self, conn: &Connection, sql: &str, args: &[Value]) -> Result<Vec<Key>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let keys = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn query_fired(&self, conn: &Connection, sql: &str, args: &[Value]) -> Result<Vec<FiredTriggerRecord>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let records = stmt
            .query_map(params_from_iter(args.iter()), row_to_fired_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count(&self, conn: &Connection, sql: &str, args: &[Value]) -> Result<usize> {
        let n: i64 = conn.query_row(&self.sql(sql), params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(n as usize)
    }

    fn name(&self) -> Value {
        Value::Text(self.sched_name.clone())
    }
}

/// `?start, ?start+1, …` placeholders for an IN list of `n` values.
fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn parse_state(idx: usize, s: String) -> rusqlite::Result<TriggerState> {
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Raw trigger columns (order from `SELECT_TRIGGER`); decoded outside the
/// row callback because schedule and data decoding have their own errors.
struct TriggerRow {
    key: Key,
    job_key: Key,
    description: Option<String>,
    next: Option<i64>,
    prev: Option<i64>,
    priority: i32,
    kind: String,
    start: i64,
    end: Option<i64>,
    calendar: Option<String>,
    misfire: i32,
    job_data: String,
    props: String,
}

fn row_to_trigger_row(row: &Row<'_>) -> rusqlite::Result<TriggerRow> {
    Ok(TriggerRow {
        key: Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        job_key: Key::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        description: row.get(4)?,
        next: row.get(5)?,
        prev: row.get(6)?,
        priority: row.get(7)?,
        kind: row.get(8)?,
        start: row.get(9)?,
        end: row.get(10)?,
        calendar: row.get(11)?,
        misfire: row.get(12)?,
        job_data: row.get(13)?,
        props: row.get(14)?,
    })
}

fn row_to_fired_trigger(row: &Row<'_>) -> rusqlite::Result<FiredTriggerRecord> {
    let job_name: Option<String> = row.get(8)?;
    let job_group: Option<String> = row.get(9)?;
    Ok(FiredTriggerRecord {
        fire_instance_id: row.get(0)?,
        trigger_key: Key::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        instance_id: row.get(3)?,
        fired_timestamp: from_millis(row.get(4)?),
        scheduled_timestamp: from_millis(row.get(5)?),
        priority: row.get(6)?,
        state: parse_state(7, row.get(7)?)?,
        job_key: job_name.zip(job_group).map(|(n, g)| Key::new(n, g)),
        job_disallows_concurrent_execution: row.get(10)?,
        job_requests_recovery: row.get(11)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<(JobDetail, String)> {
    let job = JobDetail {
        key: Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        description: row.get(2)?,
        job_class: row.get(3)?,
        durable: row.get(4)?,
        concurrent_execution_disallowed: row.get(5)?,
        persist_data_after_execution: row.get(6)?,
        requests_recovery: row.get(7)?,
        job_data: JobDataMap::new(),
    };
    Ok((job, row.get(8)?))
}

impl StoreDelegate for SqliteDelegate {
    // --- jobs --------------------------------------------------------------

    fn insert_job_detail(&self, conn: &Connection, job: &JobDetail) -> Result<()> {
        let data = serde_json::to_string(&job.job_data)?;
        conn.prepare_cached(&self.sql(
            "INSERT INTO {prefix}JOB_DETAILS
             (SCHED_NAME, JOB_NAME, JOB_GROUP, DESCRIPTION, JOB_CLASS_NAME, IS_DURABLE,
              IS_NONCONCURRENT, IS_UPDATE_DATA, REQUESTS_RECOVERY, JOB_DATA)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        ))?
        .execute(params![
            self.sched_name,
            job.key.name,
            job.key.group,
            job.description,
            job.job_class,
            job.durable,
            job.concurrent_execution_disallowed,
            job.persist_data_after_execution,
            job.requests_recovery,
            data,
        ])?;
        Ok(())
    }

    fn update_job_detail(&self, conn: &Connection, job: &JobDetail) -> Result<usize> {
        let data = serde_json::to_string(&job.job_data)?;
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}JOB_DETAILS
                 SET DESCRIPTION = ?4, JOB_CLASS_NAME = ?5, IS_DURABLE = ?6,
                     IS_NONCONCURRENT = ?7, IS_UPDATE_DATA = ?8, REQUESTS_RECOVERY = ?9,
                     JOB_DATA = ?10
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            ))?
            .execute(params![
                self.sched_name,
                job.key.name,
                job.key.group,
                job.description,
                job.job_class,
                job.durable,
                job.concurrent_execution_disallowed,
                job.persist_data_after_execution,
                job.requests_recovery,
                data,
            ])?;
        Ok(n)
    }

    fn delete_job_detail(&self, conn: &Connection, key: &Key) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}JOB_DETAILS
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            ))?
            .execute(params![self.sched_name, key.name, key.group])?;
        Ok(n)
    }

    fn select_job_detail(&self, conn: &Connection, key: &Key) -> Result<Option<JobDetail>> {
        let sql = self.sql(&format!("{SELECT_JOB} AND JOB_NAME = ?2 AND JOB_GROUP = ?3"));
        let row = conn
            .prepare_cached(&sql)?
            .query_row(params![self.sched_name, key.name, key.group], row_to_job)
            .optional()?;
        match row {
            Some((mut job, data)) => {
                job.job_data = serde_json::from_str(&data)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    fn job_exists(&self, conn: &Connection, key: &Key) -> Result<bool> {
        let n = self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}JOB_DETAILS
             WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            &[self.name(), text(&key.name), text(&key.group)],
        )?;
        Ok(n > 0)
    }

    fn update_job_data(&self, conn: &Connection, job: &JobDetail) -> Result<usize> {
        let data = serde_json::to_string(&job.job_data)?;
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}JOB_DETAILS SET JOB_DATA = ?4
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            ))?
            .execute(params![self.sched_name, job.key.name, job.key.group, data])?;
        Ok(n)
    }

    fn select_number_of_jobs(&self, conn: &Connection) -> Result<usize> {
        self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}JOB_DETAILS WHERE SCHED_NAME = ?1",
            &[self.name()],
        )
    }

    fn select_job_keys(&self, conn: &Connection, group: Option<&str>) -> Result<Vec<Key>> {
        match group {
            Some(g) => self.query_keys(
                conn,
                &self.sql(
                    "SELECT JOB_NAME, JOB_GROUP FROM {prefix}JOB_DETAILS
                     WHERE SCHED_NAME = ?1 AND JOB_GROUP = ?2 ORDER BY JOB_NAME",
                ),
                &[self.name(), text(g)],
            ),
            None => self.query_keys(
                conn,
                &self.sql(
                    "SELECT JOB_NAME, JOB_GROUP FROM {prefix}JOB_DETAILS
                     WHERE SCHED_NAME = ?1 ORDER BY JOB_GROUP, JOB_NAME",
                ),
                &[self.name()],
            ),
        }
    }

    // --- triggers ----------------------------------------------------------

    fn insert_trigger(&self, conn: &Connection, trigger: &Trigger, state: TriggerState) -> Result<()> {
        let (kind, props) = self.registry.encode(&trigger.schedule)?;
        let data = serde_json::to_string(&trigger.job_data)?;
        conn.prepare_cached(&self.sql(
            "INSERT INTO {prefix}TRIGGERS
             (SCHED_NAME, TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION,
              NEXT_FIRE_TIME, PREV_FIRE_TIME, PRIORITY, TRIGGER_STATE, TRIGGER_TYPE,
              START_TIME, END_TIME, CALENDAR_NAME, MISFIRE_INSTR, JOB_DATA, SCHEDULE_PROPS)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        ))?
        .execute(params![
            self.sched_name,
            trigger.key.name,
            trigger.key.group,
            trigger.job_key.name,
            trigger.job_key.group,
            trigger.description,
            trigger.next_fire_time.map(to_millis),
            trigger.previous_fire_time.map(to_millis),
            trigger.priority,
            state.as_str(),
            kind,
            to_millis(trigger.start_time),
            trigger.end_time.map(to_millis),
            trigger.calendar_name,
            trigger.misfire_instruction.code(),
            data,
            props,
        ])?;
        Ok(())
    }

    fn update_trigger(&self, conn: &Connection, trigger: &Trigger, state: TriggerState) -> Result<usize> {
        let (kind, props) = self.registry.encode(&trigger.schedule)?;
        let data = serde_json::to_string(&trigger.job_data)?;
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}TRIGGERS
                 SET JOB_NAME = ?4, JOB_GROUP = ?5, DESCRIPTION = ?6, NEXT_FIRE_TIME = ?7,
                     PREV_FIRE_TIME = ?8, PRIORITY = ?9, TRIGGER_STATE = ?10, TRIGGER_TYPE = ?11,
                     START_TIME = ?12, END_TIME = ?13, CALENDAR_NAME = ?14, MISFIRE_INSTR = ?15,
                     JOB_DATA = ?16, SCHEDULE_PROPS = ?17
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .execute(params![
                self.sched_name,
                trigger.key.name,
                trigger.key.group,
                trigger.job_key.name,
                trigger.job_key.group,
                trigger.description,
                trigger.next_fire_time.map(to_millis),
                trigger.previous_fire_time.map(to_millis),
                trigger.priority,
                state.as_str(),
                kind,
                to_millis(trigger.start_time),
                trigger.end_time.map(to_millis),
                trigger.calendar_name,
                trigger.misfire_instruction.code(),
                data,
                props,
            ])?;
        Ok(n)
    }

    fn delete_trigger(&self, conn: &Connection, key: &Key) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .execute(params![self.sched_name, key.name, key.group])?;
        Ok(n)
    }

    fn trigger_exists(&self, conn: &Connection, key: &Key) -> Result<bool> {
        let n = self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}TRIGGERS
             WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            &[self.name(), text(&key.name), text(&key.group)],
        )?;
        Ok(n > 0)
    }

    fn select_trigger(&self, conn: &Connection, key: &Key) -> Result<Option<Trigger>> {
        let sql = self.sql(&format!(
            "{SELECT_TRIGGER} AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3"
        ));
        let mut triggers =
            self.query_triggers(conn, &sql, &[self.name(), text(&key.name), text(&key.group)])?;
        Ok(triggers.pop())
    }

    fn select_trigger_state(&self, conn: &Connection, key: &Key) -> Result<Option<TriggerState>> {
        let state: Option<String> = conn
            .prepare_cached(&self.sql(
                "SELECT TRIGGER_STATE FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .query_row(params![self.sched_name, key.name, key.group], |row| row.get(0))
            .optional()?;
        state
            .map(|s| s.parse().map_err(JobStoreError::Persistence))
            .transpose()
    }

    fn select_job_key_for_trigger(&self, conn: &Connection, key: &Key) -> Result<Option<Key>> {
        let job_key = conn
            .prepare_cached(&self.sql(
                "SELECT JOB_NAME, JOB_GROUP FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .query_row(params![self.sched_name, key.name, key.group], |row| {
                Ok(Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        Ok(job_key)
    }

    fn select_trigger_job_data(&self, conn: &Connection, key: &Key) -> Result<Option<JobDataMap>> {
        let data: Option<String> = conn
            .prepare_cached(&self.sql(
                "SELECT JOB_DATA FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .query_row(params![self.sched_name, key.name, key.group], |row| row.get(0))
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    fn select_triggers_for_job(&self, conn: &Connection, job_key: &Key) -> Result<Vec<Trigger>> {
        let sql = self.sql(&format!(
            "{SELECT_TRIGGER} AND JOB_NAME = ?2 AND JOB_GROUP = ?3 ORDER BY TRIGGER_GROUP, TRIGGER_NAME"
        ));
        self.query_triggers(conn, &sql, &[self.name(), text(&job_key.name), text(&job_key.group)])
    }

    fn select_trigger_keys_for_job(&self, conn: &Connection, job_key: &Key) -> Result<Vec<Key>> {
        self.query_keys(
            conn,
            &self.sql(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            ),
            &[self.name(), text(&job_key.name), text(&job_key.group)],
        )
    }

    fn select_triggers_for_calendar(&self, conn: &Connection, name: &str) -> Result<Vec<Trigger>> {
        let sql = self.sql(&format!("{SELECT_TRIGGER} AND CALENDAR_NAME = ?2"));
        self.query_triggers(conn, &sql, &[self.name(), text(name)])
    }

    fn calendar_is_referenced(&self, conn: &Connection, name: &str) -> Result<bool> {
        let n = self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}TRIGGERS WHERE SCHED_NAME = ?1 AND CALENDAR_NAME = ?2",
            &[self.name(), text(name)],
        )?;
        Ok(n > 0)
    }

    fn select_trigger_keys(&self, conn: &Connection, group: Option<&str>) -> Result<Vec<Key>> {
        match group {
            Some(g) => self.query_keys(
                conn,
                &self.sql(
                    "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                     WHERE SCHED_NAME = ?1 AND TRIGGER_GROUP = ?2 ORDER BY TRIGGER_NAME",
                ),
                &[self.name(), text(g)],
            ),
            None => self.query_keys(
                conn,
                &self.sql(
                    "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                     WHERE SCHED_NAME = ?1 ORDER BY TRIGGER_GROUP, TRIGGER_NAME",
                ),
                &[self.name()],
            ),
        }
    }

    fn select_trigger_group_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(&self.sql(
            "SELECT DISTINCT TRIGGER_GROUP FROM {prefix}TRIGGERS
             WHERE SCHED_NAME = ?1 ORDER BY TRIGGER_GROUP",
        ))?;
        let groups = stmt
            .query_map(params![self.sched_name], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(groups)
    }

    fn select_number_of_triggers(&self, conn: &Connection) -> Result<usize> {
        self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}TRIGGERS WHERE SCHED_NAME = ?1",
            &[self.name()],
        )
    }

    fn select_number_of_triggers_for_job(&self, conn: &Connection, job_key: &Key) -> Result<usize> {
        self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}TRIGGERS
             WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            &[self.name(), text(&job_key.name), text(&job_key.group)],
        )
    }

    fn select_triggers_in_state(&self, conn: &Connection, state: TriggerState) -> Result<Vec<Key>> {
        self.query_keys(
            conn,
            &self.sql(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_STATE = ?2",
            ),
            &[self.name(), text(state.as_str())],
        )
    }

    fn update_trigger_state(&self, conn: &Connection, key: &Key, state: TriggerState) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}TRIGGERS SET TRIGGER_STATE = ?4
                 WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3",
            ))?
            .execute(params![self.sched_name, key.name, key.group, state.as_str()])?;
        Ok(n)
    }

    fn update_trigger_state_from_other_states(
        &self,
        conn: &Connection,
        key: &Key,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = self.sql(&format!(
            "UPDATE {{prefix}}TRIGGERS SET TRIGGER_STATE = ?4
             WHERE SCHED_NAME = ?1 AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3
               AND TRIGGER_STATE IN ({})",
            placeholders(5, old_states.len())
        ));
        let mut args = vec![
            self.name(),
            text(&key.name),
            text(&key.group),
            text(new_state.as_str()),
        ];
        args.extend(old_states.iter().map(|s| text(s.as_str())));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(args.iter()))?)
    }

    fn update_trigger_states_for_job(&self, conn: &Connection, job_key: &Key, state: TriggerState) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}TRIGGERS SET TRIGGER_STATE = ?4
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3",
            ))?
            .execute(params![self.sched_name, job_key.name, job_key.group, state.as_str()])?;
        Ok(n)
    }

    fn update_trigger_states_for_job_from_other_state(
        &self,
        conn: &Connection,
        job_key: &Key,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}TRIGGERS SET TRIGGER_STATE = ?4
                 WHERE SCHED_NAME = ?1 AND JOB_NAME = ?2 AND JOB_GROUP = ?3 AND TRIGGER_STATE = ?5",
            ))?
            .execute(params![
                self.sched_name,
                job_key.name,
                job_key.group,
                new_state.as_str(),
                old_state.as_str(),
            ])?;
        Ok(n)
    }

    fn update_trigger_group_state_from_other_states(
        &self,
        conn: &Connection,
        group: &str,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = self.sql(&format!(
            "UPDATE {{prefix}}TRIGGERS SET TRIGGER_STATE = ?3
             WHERE SCHED_NAME = ?1 AND TRIGGER_GROUP = ?2 AND TRIGGER_STATE IN ({})",
            placeholders(4, old_states.len())
        ));
        let mut args = vec![self.name(), text(group), text(new_state.as_str())];
        args.extend(old_states.iter().map(|s| text(s.as_str())));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(args.iter()))?)
    }

    fn update_trigger_states_from_other_states(
        &self,
        conn: &Connection,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = self.sql(&format!(
            "UPDATE {{prefix}}TRIGGERS SET TRIGGER_STATE = ?2
             WHERE SCHED_NAME = ?1 AND TRIGGER_STATE IN ({})",
            placeholders(3, old_states.len())
        ));
        let mut args = vec![self.name(), text(new_state.as_str())];
        args.extend(old_states.iter().map(|s| text(s.as_str())));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(args.iter()))?)
    }

    fn select_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<(Vec<Key>, bool)> {
        // One extra row tells us whether more remain past the limit.
        let fetch = limit.map(|n| n as i64 + 1).unwrap_or(-1);
        let mut keys = self.query_keys(
            conn,
            &self.sql(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND MISFIRE_INSTR <> -1 AND NEXT_FIRE_TIME < ?2
                   AND TRIGGER_STATE = ?3
                 ORDER BY NEXT_FIRE_TIME ASC, PRIORITY DESC
                 LIMIT ?4",
            ),
            &[
                self.name(),
                Value::Integer(to_millis(misfire_time)),
                text(state.as_str()),
                Value::Integer(fetch),
            ],
        )?;
        let has_more = match limit {
            Some(n) if keys.len() > n => {
                keys.truncate(n);
                true
            }
            _ => false,
        };
        Ok((keys, has_more))
    }

    fn count_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
    ) -> Result<usize> {
        self.count(
            conn,
            "SELECT COUNT(TRIGGER_NAME) FROM {prefix}TRIGGERS
             WHERE SCHED_NAME = ?1 AND MISFIRE_INSTR <> -1 AND NEXT_FIRE_TIME < ?2
               AND TRIGGER_STATE = ?3",
            &[
                self.name(),
                Value::Integer(to_millis(misfire_time)),
                text(state.as_str()),
            ],
        )
    }

    fn select_triggers_to_acquire(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Key>> {
        self.query_keys(
            conn,
            &self.sql(
                "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {prefix}TRIGGERS
                 WHERE SCHED_NAME = ?1 AND TRIGGER_STATE = ?2 AND NEXT_FIRE_TIME <= ?3
                   AND (MISFIRE_INSTR = -1 OR NEXT_FIRE_TIME >= ?4)
                 ORDER BY NEXT_FIRE_TIME ASC, PRIORITY DESC
                 LIMIT ?5",
            ),
            &[
                self.name(),
                text(TriggerState::Waiting.as_str()),
                Value::Integer(to_millis(no_later_than)),
                Value::Integer(to_millis(no_earlier_than)),
                Value::Integer(max_count.max(1) as i64),
            ],
        )
    }

    // --- fired triggers ----------------------------------------------------

    fn insert_fired_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
        job: Option<&JobDetail>,
        instance_id: &str,
    ) -> Result<()> {
        let entry_id = fire_instance_id(trigger)?;
        let scheduled = trigger.next_fire_time.unwrap_or_else(Utc::now);
        conn.prepare_cached(&self.sql(
            "INSERT INTO {prefix}FIRED_TRIGGERS
             (SCHED_NAME, ENTRY_ID, TRIGGER_NAME, TRIGGER_GROUP, INSTANCE_NAME, FIRED_TIME,
              SCHED_TIME, PRIORITY, STATE, JOB_NAME, JOB_GROUP, IS_NONCONCURRENT, REQUESTS_RECOVERY)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        ))?
        .execute(params![
            self.sched_name,
            entry_id,
            trigger.key.name,
            trigger.key.group,
            instance_id,
            to_millis(Utc::now()),
            to_millis(scheduled),
            trigger.priority,
            state.as_str(),
            job.map(|j| j.key.name.as_str()),
            job.map(|j| j.key.group.as_str()),
            job.is_some_and(|j| j.concurrent_execution_disallowed),
            job.is_some_and(|j| j.requests_recovery),
        ])?;
        Ok(())
    }

    fn update_fired_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
        job: Option<&JobDetail>,
        instance_id: &str,
    ) -> Result<usize> {
        let entry_id = fire_instance_id(trigger)?;
        let scheduled = trigger.next_fire_time.unwrap_or_else(Utc::now);
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}FIRED_TRIGGERS
                 SET INSTANCE_NAME = ?3, FIRED_TIME = ?4, SCHED_TIME = ?5, STATE = ?6,
                     JOB_NAME = ?7, JOB_GROUP = ?8, IS_NONCONCURRENT = ?9, REQUESTS_RECOVERY = ?10
                 WHERE SCHED_NAME = ?1 AND ENTRY_ID = ?2",
            ))?
            .execute(params![
                self.sched_name,
                entry_id,
                instance_id,
                to_millis(Utc::now()),
                to_millis(scheduled),
                state.as_str(),
                job.map(|j| j.key.name.as_str()),
                job.map(|j| j.key.group.as_str()),
                job.is_some_and(|j| j.concurrent_execution_disallowed),
                job.is_some_and(|j| j.requests_recovery),
            ])?;
        Ok(n)
    }

    fn select_fired_triggers_for_trigger(&self, conn: &Connection, key: &Key) -> Result<Vec<FiredTriggerRecord>> {
        let sql = self.sql(&format!(
            "{SELECT_FIRED} AND TRIGGER_NAME = ?2 AND TRIGGER_GROUP = ?3"
        ));
        self.query_fired(conn, &sql, &[self.name(), text(&key.name), text(&key.group)])
    }

    fn select_fired_triggers_for_job(&self, conn: &Connection, job_key: &Key) -> Result<Vec<FiredTriggerRecord>> {
        let sql = self.sql(&format!(
            "{SELECT_FIRED} AND JOB_NAME = ?2 AND JOB_GROUP = ?3"
        ));
        self.query_fired(conn, &sql, &[self.name(), text(&job_key.name), text(&job_key.group)])
    }

    fn select_instance_fired_triggers(&self, conn: &Connection, instance_id: &str) -> Result<Vec<FiredTriggerRecord>> {
        let sql = self.sql(&format!("{SELECT_FIRED} AND INSTANCE_NAME = ?2"));
        self.query_fired(conn, &sql, &[self.name(), text(instance_id)])
    }

    fn select_fired_trigger_instance_names(&self, conn: &Connection) -> Result<HashSet<String>> {
        let mut stmt = conn.prepare_cached(&self.sql(
            "SELECT DISTINCT INSTANCE_NAME FROM {prefix}FIRED_TRIGGERS WHERE SCHED_NAME = ?1",
        ))?;
        let names = stmt
            .query_map(params![self.sched_name], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(names)
    }

    fn delete_fired_trigger(&self, conn: &Connection, fire_instance_id: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}FIRED_TRIGGERS WHERE SCHED_NAME = ?1 AND ENTRY_ID = ?2",
            ))?
            .execute(params![self.sched_name, fire_instance_id])?;
        Ok(n)
    }

    fn delete_instance_fired_triggers(&self, conn: &Connection, instance_id: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}FIRED_TRIGGERS WHERE SCHED_NAME = ?1 AND INSTANCE_NAME = ?2",
            ))?
            .execute(params![self.sched_name, instance_id])?;
        Ok(n)
    }

    fn delete_fired_triggers(&self, conn: &Connection) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql("DELETE FROM {prefix}FIRED_TRIGGERS WHERE SCHED_NAME = ?1"))?
            .execute(params![self.sched_name])?;
        Ok(n)
    }

    // --- calendars ---------------------------------------------------------

    fn insert_calendar(&self, conn: &Connection, name: &str, calendar: &Calendar) -> Result<()> {
        let blob = serde_json::to_string(calendar)?;
        conn.prepare_cached(&self.sql(
            "INSERT INTO {prefix}CALENDARS (SCHED_NAME, CALENDAR_NAME, CALENDAR)
             VALUES (?1, ?2, ?3)",
        ))?
        .execute(params![self.sched_name, name, blob])?;
        Ok(())
    }

    fn update_calendar(&self, conn: &Connection, name: &str, calendar: &Calendar) -> Result<usize> {
        let blob = serde_json::to_string(calendar)?;
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}CALENDARS SET CALENDAR = ?3
                 WHERE SCHED_NAME = ?1 AND CALENDAR_NAME = ?2",
            ))?
            .execute(params![self.sched_name, name, blob])?;
        Ok(n)
    }

    fn calendar_exists(&self, conn: &Connection, name: &str) -> Result<bool> {
        let n = self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}CALENDARS WHERE SCHED_NAME = ?1 AND CALENDAR_NAME = ?2",
            &[self.name(), text(name)],
        )?;
        Ok(n > 0)
    }

    fn select_calendar(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>> {
        let blob: Option<String> = conn
            .prepare_cached(&self.sql(
                "SELECT CALENDAR FROM {prefix}CALENDARS
                 WHERE SCHED_NAME = ?1 AND CALENDAR_NAME = ?2",
            ))?
            .query_row(params![self.sched_name, name], |row| row.get(0))
            .optional()?;
        Ok(blob.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn delete_calendar(&self, conn: &Connection, name: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}CALENDARS WHERE SCHED_NAME = ?1 AND CALENDAR_NAME = ?2",
            ))?
            .execute(params![self.sched_name, name])?;
        Ok(n)
    }

    fn select_number_of_calendars(&self, conn: &Connection) -> Result<usize> {
        self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}CALENDARS WHERE SCHED_NAME = ?1",
            &[self.name()],
        )
    }

    fn select_calendar_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(&self.sql(
            "SELECT CALENDAR_NAME FROM {prefix}CALENDARS WHERE SCHED_NAME = ?1 ORDER BY CALENDAR_NAME",
        ))?;
        let names = stmt
            .query_map(params![self.sched_name], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    // --- paused groups -----------------------------------------------------

    fn insert_paused_trigger_group(&self, conn: &Connection, group: &str) -> Result<()> {
        conn.prepare_cached(&self.sql(
            "INSERT OR IGNORE INTO {prefix}PAUSED_TRIGGER_GRPS (SCHED_NAME, TRIGGER_GROUP)
             VALUES (?1, ?2)",
        ))?
        .execute(params![self.sched_name, group])?;
        Ok(())
    }

    fn delete_paused_trigger_group(&self, conn: &Connection, group: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}PAUSED_TRIGGER_GRPS WHERE SCHED_NAME = ?1 AND TRIGGER_GROUP = ?2",
            ))?
            .execute(params![self.sched_name, group])?;
        Ok(n)
    }

    fn is_trigger_group_paused(&self, conn: &Connection, group: &str) -> Result<bool> {
        let n = self.count(
            conn,
            "SELECT COUNT(*) FROM {prefix}PAUSED_TRIGGER_GRPS
             WHERE SCHED_NAME = ?1 AND TRIGGER_GROUP = ?2",
            &[self.name(), text(group)],
        )?;
        Ok(n > 0)
    }

    fn select_paused_trigger_groups(&self, conn: &Connection) -> Result<HashSet<String>> {
        let mut stmt = conn.prepare_cached(&self.sql(
            "SELECT TRIGGER_GROUP FROM {prefix}PAUSED_TRIGGER_GRPS WHERE SCHED_NAME = ?1",
        ))?;
        let groups = stmt
            .query_map(params![self.sched_name], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(groups)
    }

    // --- scheduler state ---------------------------------------------------

    fn insert_scheduler_state(
        &self,
        conn: &Connection,
        instance_id: &str,
        checkin: DateTime<Utc>,
        interval_ms: i64,
    ) -> Result<()> {
        conn.prepare_cached(&self.sql(
            "INSERT INTO {prefix}SCHEDULER_STATE
             (SCHED_NAME, INSTANCE_NAME, LAST_CHECKIN_TIME, CHECKIN_INTERVAL)
             VALUES (?1, ?2, ?3, ?4)",
        ))?
        .execute(params![self.sched_name, instance_id, to_millis(checkin), interval_ms])?;
        Ok(())
    }

    fn update_scheduler_state(&self, conn: &Connection, instance_id: &str, checkin: DateTime<Utc>) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "UPDATE {prefix}SCHEDULER_STATE SET LAST_CHECKIN_TIME = ?3
                 WHERE SCHED_NAME = ?1 AND INSTANCE_NAME = ?2",
            ))?
            .execute(params![self.sched_name, instance_id, to_millis(checkin)])?;
        Ok(n)
    }

    fn delete_scheduler_state(&self, conn: &Connection, instance_id: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&self.sql(
                "DELETE FROM {prefix}SCHEDULER_STATE WHERE SCHED_NAME = ?1 AND INSTANCE_NAME = ?2",
            ))?
            .execute(params![self.sched_name, instance_id])?;
        Ok(n)
    }

    fn select_scheduler_state_records(
        &self,
        conn: &Connection,
        instance_id: Option<&str>,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let map = |row: &Row<'_>| -> rusqlite::Result<SchedulerStateRecord> {
            Ok(SchedulerStateRecord {
                instance_id: row.get(0)?,
                checkin_timestamp: from_millis(row.get(1)?),
                checkin_interval_ms: row.get(2)?,
            })
        };
        let records = match instance_id {
            Some(id) => conn
                .prepare_cached(&self.sql(
                    "SELECT INSTANCE_NAME, LAST_CHECKIN_TIME, CHECKIN_INTERVAL
                     FROM {prefix}SCHEDULER_STATE WHERE SCHED_NAME = ?1 AND INSTANCE_NAME = ?2",
                ))?
                .query_map(params![self.sched_name, id], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => conn
                .prepare_cached(&self.sql(
                    "SELECT INSTANCE_NAME, LAST_CHECKIN_TIME, CHECKIN_INTERVAL
                     FROM {prefix}SCHEDULER_STATE WHERE SCHED_NAME = ?1 ORDER BY INSTANCE_NAME",
                ))?
                .query_map(params![self.sched_name], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(records)
    }

    fn clear_data(&self, conn: &Connection) -> Result<()> {
        for table in [
            "FIRED_TRIGGERS",
            "TRIGGERS",
            "JOB_DETAILS",
            "CALENDARS",
            "PAUSED_TRIGGER_GRPS",
        ] {
            conn.execute(
                &format!("DELETE FROM {}{table} WHERE SCHED_NAME = ?1", self.prefix),
                params![self.sched_name],
            )?;
        }
        Ok(())
    }
}

fn fire_instance_id(trigger: &Trigger) -> Result<&str> {
    trigger.fire_instance_id.as_deref().ok_or_else(|| {
        JobStoreError::InvalidArgument(format!("trigger {} has no fire instance id", trigger.key))
    })
}
