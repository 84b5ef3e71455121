use std::collections::HashSet;
use std::sync::atomic::Ordering;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, instrument};

use super::{JobStore, TxContext};
use crate::calendar::Calendar;
use crate::error::{JobStoreError, Result};
use crate::lock::LockName;
use crate::types::{JobDetail, Key, Trigger, TriggerState, ALL_GROUPS_PAUSED};

impl JobStore {
    /// Self-managed unit under `TRIGGER_ACCESS`.
    fn write<T>(&self, work: impl FnOnce(&mut TxContext<'_>) -> Result<T>) -> Result<T> {
        self.execute_in_non_managed_tx_lock(Some(LockName::TriggerAccess), work, None)
    }

    // --- building blocks shared with firing, misfire and recovery ----------

    pub(super) fn store_job_in(&self, conn: &Connection, job: &JobDetail, replace: bool) -> Result<()> {
        if self.delegate.job_exists(conn, &job.key)? {
            if !replace {
                return Err(JobStoreError::ObjectAlreadyExists {
                    kind: "job",
                    key: job.key.to_string(),
                });
            }
            self.delegate.update_job_detail(conn, job)?;
        } else {
            self.delegate.insert_job_detail(conn, job)?;
        }
        Ok(())
    }

    /// Insert or update a trigger.
    ///
    /// Unless `force_state`, a trigger landing in a paused group (or while all
    /// groups are paused) is stored PAUSED instead of WAITING/ACQUIRED. A
    /// trigger of a concurrency-disallowed job that is executing right now is
    /// stored blocked, except for recovery triggers.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn store_trigger_in(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        job: Option<&JobDetail>,
        replace: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> Result<()> {
        let exists = self.delegate.trigger_exists(conn, &trigger.key)?;
        if exists && !replace {
            return Err(JobStoreError::ObjectAlreadyExists {
                kind: "trigger",
                key: trigger.key.to_string(),
            });
        }

        let mut state = state;
        if !force_state {
            let mut paused = self.delegate.is_trigger_group_paused(conn, &trigger.key.group)?;
            if !paused {
                paused = self.delegate.is_trigger_group_paused(conn, ALL_GROUPS_PAUSED)?;
                if paused {
                    self.delegate
                        .insert_paused_trigger_group(conn, &trigger.key.group)?;
                }
            }
            if paused && matches!(state, TriggerState::Waiting | TriggerState::Acquired) {
                state = TriggerState::Paused;
            }
        }

        let loaded;
        let job = match job {
            Some(job) => job,
            None => {
                loaded = self
                    .delegate
                    .select_job_detail(conn, &trigger.job_key)?
                    .ok_or_else(|| JobStoreError::JobNotFound {
                        key: trigger.job_key.to_string(),
                    })?;
                &loaded
            }
        };

        if job.concurrent_execution_disallowed && !recovering {
            state = self.check_blocked_state(conn, &job.key, state)?;
        }

        if exists {
            self.delegate.update_trigger(conn, trigger, state)?;
        } else {
            self.delegate.insert_trigger(conn, trigger, state)?;
        }
        Ok(())
    }

    /// WAITING/PAUSED become BLOCKED/PAUSED_BLOCKED while the job has an
    /// executing fire that disallows concurrency.
    pub(super) fn check_blocked_state(
        &self,
        conn: &Connection,
        job_key: &Key,
        current: TriggerState,
    ) -> Result<TriggerState> {
        if !matches!(current, TriggerState::Waiting | TriggerState::Paused) {
            return Ok(current);
        }
        let fired = self.delegate.select_fired_triggers_for_job(conn, job_key)?;
        match fired.first() {
            Some(rec) if rec.job_disallows_concurrent_execution => Ok(match current {
                TriggerState::Paused => TriggerState::PausedBlocked,
                _ => TriggerState::Blocked,
            }),
            _ => Ok(current),
        }
    }

    /// Delete a trigger; its job goes too when it is not durable and has no
    /// triggers left.
    pub(super) fn remove_trigger_in(&self, conn: &Connection, key: &Key) -> Result<bool> {
        let job = match self.delegate.select_job_key_for_trigger(conn, key)? {
            Some(job_key) => self.delegate.select_job_detail(conn, &job_key)?,
            None => None,
        };
        let removed = self.delegate.delete_trigger(conn, key)? > 0;
        if let Some(job) = job {
            if !job.durable && self.delegate.select_number_of_triggers_for_job(conn, &job.key)? == 0 {
                debug!(job = %job.key, "removing non-durable job without triggers");
                self.delegate.delete_job_detail(conn, &job.key)?;
            }
        }
        Ok(removed)
    }

    pub(super) fn remove_job_in(&self, conn: &Connection, key: &Key) -> Result<bool> {
        for trigger_key in self.delegate.select_trigger_keys_for_job(conn, key)? {
            self.delegate.delete_trigger(conn, &trigger_key)?;
        }
        Ok(self.delegate.delete_job_detail(conn, key)? > 0)
    }

    pub(super) fn retrieve_calendar_in(
        &self,
        conn: &Connection,
        name: Option<&str>,
    ) -> Result<Option<Calendar>> {
        let Some(name) = name else {
            return Ok(None);
        };
        if !self.config.clustered {
            if let Some(cached) = self.calendar_cache.get(name) {
                return Ok(Some(cached.clone()));
            }
        }
        let calendar = self.delegate.select_calendar(conn, name)?;
        if let (Some(cal), false) = (&calendar, self.config.clustered) {
            self.calendar_cache.insert(name.to_string(), cal.clone());
        }
        Ok(calendar)
    }

    fn pause_trigger_in(&self, conn: &Connection, key: &Key) -> Result<()> {
        match self.delegate.select_trigger_state(conn, key)? {
            Some(TriggerState::Waiting | TriggerState::Acquired) => {
                self.delegate
                    .update_trigger_state(conn, key, TriggerState::Paused)?;
            }
            Some(TriggerState::Blocked) => {
                self.delegate
                    .update_trigger_state(conn, key, TriggerState::PausedBlocked)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn pause_trigger_group_in(&self, conn: &Connection, group: &str) -> Result<()> {
        self.delegate.update_trigger_group_state_from_other_states(
            conn,
            group,
            TriggerState::Paused,
            &[TriggerState::Acquired, TriggerState::Waiting],
        )?;
        self.delegate.update_trigger_group_state_from_other_states(
            conn,
            group,
            TriggerState::PausedBlocked,
            &[TriggerState::Blocked],
        )?;
        self.delegate.insert_paused_trigger_group(conn, group)
    }

    /// Move a paused trigger back to WAITING (or BLOCKED). When it went
    /// overdue while paused and the scheduler is running, its misfire
    /// instruction is applied first.
    fn resume_trigger_in(&self, conn: &Connection, key: &Key) -> Result<()> {
        let Some(trigger) = self.delegate.select_trigger(conn, key)? else {
            return Ok(());
        };
        let state = self.delegate.select_trigger_state(conn, key)?;
        if !matches!(state, Some(TriggerState::Paused | TriggerState::PausedBlocked)) {
            return Ok(());
        }
        let new_state = self.check_blocked_state(conn, &trigger.job_key, TriggerState::Waiting)?;

        let now = Utc::now();
        let overdue = trigger.next_fire_time.is_some_and(|t| t < now);
        let mut misfired = false;
        if overdue && self.scheduler_running.load(Ordering::SeqCst) {
            misfired = self.update_misfired_trigger(conn, trigger, new_state, now)?;
        }
        if !misfired {
            self.delegate.update_trigger_state_from_other_states(
                conn,
                key,
                new_state,
                &[TriggerState::Paused, TriggerState::PausedBlocked],
            )?;
        }
        Ok(())
    }

    fn resume_trigger_group_in(&self, conn: &Connection, group: &str) -> Result<()> {
        self.delegate.delete_paused_trigger_group(conn, group)?;
        for key in self.delegate.select_trigger_keys(conn, Some(group))? {
            self.resume_trigger_in(conn, &key)?;
        }
        Ok(())
    }

    // --- jobs and triggers -------------------------------------------------

    #[instrument(skip_all, fields(job = %job.key, replace = replace))]
    pub fn store_job(&self, job: &JobDetail, replace: bool) -> Result<()> {
        self.write(|ctx| self.store_job_in(ctx.conn(), job, replace))
    }

    #[instrument(skip_all, fields(trigger = %trigger.key, replace = replace))]
    pub fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<()> {
        self.write(|ctx| {
            self.store_trigger_in(
                ctx.conn(),
                trigger,
                None,
                replace,
                TriggerState::Waiting,
                false,
                false,
            )?;
            ctx.signal_scheduling_change_on_commit(trigger.next_fire_time);
            Ok(())
        })
    }

    #[instrument(skip_all, fields(job = %job.key, trigger = %trigger.key))]
    pub fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
        self.write(|ctx| {
            self.store_job_in(ctx.conn(), job, false)?;
            self.store_trigger_in(
                ctx.conn(),
                trigger,
                Some(job),
                false,
                TriggerState::Waiting,
                false,
                false,
            )?;
            ctx.signal_scheduling_change_on_commit(trigger.next_fire_time);
            Ok(())
        })
    }

    /// Swap the trigger stored under `key` for `new_trigger`, which must
    /// target the same job. Returns `false` when `key` did not exist.
    #[instrument(skip_all, fields(trigger = %key))]
    pub fn replace_trigger(&self, key: &Key, new_trigger: &Trigger) -> Result<bool> {
        self.write(|ctx| {
            let conn = ctx.conn();
            let Some(job_key) = self.delegate.select_job_key_for_trigger(conn, key)? else {
                return Ok(false);
            };
            let Some(job) = self.delegate.select_job_detail(conn, &job_key)? else {
                return Ok(false);
            };
            if new_trigger.job_key != job.key {
                return Err(JobStoreError::InvalidArgument(format!(
                    "replacement trigger {} targets {} instead of {}",
                    new_trigger.key, new_trigger.job_key, job.key
                )));
            }
            let removed = self.delegate.delete_trigger(conn, key)? > 0;
            self.store_trigger_in(
                conn,
                new_trigger,
                Some(&job),
                false,
                TriggerState::Waiting,
                false,
                false,
            )?;
            ctx.signal_scheduling_change_on_commit(new_trigger.next_fire_time);
            Ok(removed)
        })
    }

    #[instrument(skip_all, fields(job = %key))]
    pub fn remove_job(&self, key: &Key) -> Result<bool> {
        self.write(|ctx| self.remove_job_in(ctx.conn(), key))
    }

    #[instrument(skip_all, fields(trigger = %key))]
    pub fn remove_trigger(&self, key: &Key) -> Result<bool> {
        self.write(|ctx| self.remove_trigger_in(ctx.conn(), key))
    }

    pub fn retrieve_job(&self, key: &Key) -> Result<Option<JobDetail>> {
        self.read(|conn| self.delegate.select_job_detail(conn, key))
    }

    pub fn retrieve_trigger(&self, key: &Key) -> Result<Option<Trigger>> {
        self.read(|conn| self.delegate.select_trigger(conn, key))
    }

    pub fn check_job_exists(&self, key: &Key) -> Result<bool> {
        self.read(|conn| self.delegate.job_exists(conn, key))
    }

    pub fn check_trigger_exists(&self, key: &Key) -> Result<bool> {
        self.read(|conn| self.delegate.trigger_exists(conn, key))
    }

    /// Current state; a trigger that does not exist reads as `Deleted`.
    pub fn get_trigger_state(&self, key: &Key) -> Result<TriggerState> {
        self.read(|conn| {
            Ok(self
                .delegate
                .select_trigger_state(conn, key)?
                .unwrap_or(TriggerState::Deleted))
        })
    }

    pub fn get_triggers_for_job(&self, job_key: &Key) -> Result<Vec<Trigger>> {
        self.read(|conn| self.delegate.select_triggers_for_job(conn, job_key))
    }

    pub fn get_job_keys(&self, group: Option<&str>) -> Result<Vec<Key>> {
        self.read(|conn| self.delegate.select_job_keys(conn, group))
    }

    pub fn get_trigger_keys(&self, group: Option<&str>) -> Result<Vec<Key>> {
        self.read(|conn| self.delegate.select_trigger_keys(conn, group))
    }

    pub fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        self.read(|conn| self.delegate.select_trigger_group_names(conn))
    }

    pub fn get_number_of_jobs(&self) -> Result<usize> {
        self.read(|conn| self.delegate.select_number_of_jobs(conn))
    }

    pub fn get_number_of_triggers(&self) -> Result<usize> {
        self.read(|conn| self.delegate.select_number_of_triggers(conn))
    }

    // --- calendars ---------------------------------------------------------

    /// Store a calendar. With `update_triggers`, triggers referencing it get
    /// their next fire time recomputed against the new version.
    #[instrument(skip_all, fields(calendar = %name, replace = replace, update_triggers = update_triggers))]
    pub fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        self.write(|ctx| {
            let conn = ctx.conn();
            if self.delegate.calendar_exists(conn, name)? {
                if !replace {
                    return Err(JobStoreError::ObjectAlreadyExists {
                        kind: "calendar",
                        key: name.to_string(),
                    });
                }
                self.delegate.update_calendar(conn, name, calendar)?;
                if update_triggers {
                    let threshold =
                        chrono::Duration::milliseconds(self.config.misfire_threshold_ms as i64);
                    let now = Utc::now();
                    for mut trigger in self.delegate.select_triggers_for_calendar(conn, name)? {
                        let state = self
                            .delegate
                            .select_trigger_state(conn, &trigger.key)?
                            .unwrap_or(TriggerState::Waiting);
                        trigger.update_with_new_calendar(Some(calendar), threshold, now);
                        self.store_trigger_in(conn, &trigger, None, true, state, false, false)?;
                        ctx.signal_scheduling_change_on_commit(trigger.next_fire_time);
                    }
                }
            } else {
                self.delegate.insert_calendar(conn, name, calendar)?;
            }
            if !self.config.clustered {
                self.calendar_cache.insert(name.to_string(), calendar.clone());
            }
            Ok(())
        })
    }

    /// Refused while any trigger references the calendar.
    #[instrument(skip_all, fields(calendar = %name))]
    pub fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.write(|ctx| {
            let conn = ctx.conn();
            if self.delegate.calendar_is_referenced(conn, name)? {
                return Err(JobStoreError::Persistence(format!(
                    "calendar '{name}' cannot be removed while triggers reference it"
                )));
            }
            self.calendar_cache.remove(name);
            Ok(self.delegate.delete_calendar(conn, name)? > 0)
        })
    }

    pub fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.read(|conn| self.retrieve_calendar_in(conn, Some(name)))
    }

    pub fn get_number_of_calendars(&self) -> Result<usize> {
        self.read(|conn| self.delegate.select_number_of_calendars(conn))
    }

    pub fn get_calendar_names(&self) -> Result<Vec<String>> {
        self.read(|conn| self.delegate.select_calendar_names(conn))
    }

    // --- pause / resume ----------------------------------------------------

    pub fn pause_trigger(&self, key: &Key) -> Result<()> {
        self.write(|ctx| self.pause_trigger_in(ctx.conn(), key))
    }

    pub fn pause_trigger_group(&self, group: &str) -> Result<()> {
        self.write(|ctx| self.pause_trigger_group_in(ctx.conn(), group))
    }

    pub fn pause_job(&self, job_key: &Key) -> Result<()> {
        self.write(|ctx| {
            for key in self.delegate.select_trigger_keys_for_job(ctx.conn(), job_key)? {
                self.pause_trigger_in(ctx.conn(), &key)?;
            }
            Ok(())
        })
    }

    /// Pause every group, including groups created afterwards.
    pub fn pause_all(&self) -> Result<()> {
        self.write(|ctx| {
            let conn = ctx.conn();
            for group in self.delegate.select_trigger_group_names(conn)? {
                self.pause_trigger_group_in(conn, &group)?;
            }
            self.delegate.insert_paused_trigger_group(conn, ALL_GROUPS_PAUSED)
        })
    }

    pub fn resume_trigger(&self, key: &Key) -> Result<()> {
        self.write(|ctx| {
            self.resume_trigger_in(ctx.conn(), key)?;
            ctx.signal_scheduling_change_on_commit(None);
            Ok(())
        })
    }

    pub fn resume_trigger_group(&self, group: &str) -> Result<()> {
        self.write(|ctx| {
            self.resume_trigger_group_in(ctx.conn(), group)?;
            ctx.signal_scheduling_change_on_commit(None);
            Ok(())
        })
    }

    pub fn resume_job(&self, job_key: &Key) -> Result<()> {
        self.write(|ctx| {
            for key in self.delegate.select_trigger_keys_for_job(ctx.conn(), job_key)? {
                self.resume_trigger_in(ctx.conn(), &key)?;
            }
            ctx.signal_scheduling_change_on_commit(None);
            Ok(())
        })
    }

    pub fn resume_all(&self) -> Result<()> {
        self.write(|ctx| {
            let conn = ctx.conn();
            for group in self.delegate.select_trigger_group_names(conn)? {
                self.resume_trigger_group_in(conn, &group)?;
            }
            for group in self.delegate.select_paused_trigger_groups(conn)? {
                self.delegate.delete_paused_trigger_group(conn, &group)?;
            }
            ctx.signal_scheduling_change_on_commit(None);
            Ok(())
        })
    }

    pub fn get_paused_trigger_groups(&self) -> Result<HashSet<String>> {
        self.read(|conn| self.delegate.select_paused_trigger_groups(conn))
    }

    /// Delete every job, trigger, calendar and paused-group marker of this
    /// scheduler.
    pub fn clear_all_scheduling_data(&self) -> Result<()> {
        self.write(|ctx| self.delegate.clear_data(ctx.conn()))?;
        self.calendar_cache.clear();
        Ok(())
    }
}
