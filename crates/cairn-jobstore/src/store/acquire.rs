use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::tx::{TxContext, Validator};
use super::JobStore;
use crate::error::Result;
use crate::lock::LockName;
use crate::types::{
    CompletedExecutionInstruction, JobDetail, Key, Trigger, TriggerFiredBundle,
    TriggerFiredResult, TriggerState, RECOVERING_JOBS_GROUP,
};

impl JobStore {
    /// Claim up to `max_count` WAITING triggers due by `no_later_than +
    /// time_window`, earliest first then highest priority.
    ///
    /// Each claimed trigger moves to ACQUIRED, gets a fresh fire-instance id
    /// and an ACQUIRED fired record for this instance. Only one trigger per
    /// concurrency-disallowed job is claimed per batch.
    #[instrument(skip(self), fields(max_count = max_count))]
    pub fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> Result<Vec<Trigger>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let lock = if max_count > 1 || self.config.acquire_triggers_within_lock {
            Some(LockName::TriggerAccess)
        } else {
            None
        };
        let validator: Validator<'_, Vec<Trigger>> = &|conn, acquired| {
            let records = self
                .delegate
                .select_instance_fired_triggers(conn, &self.instance_id)?;
            let ids: HashSet<&str> = records.iter().map(|r| r.fire_instance_id.as_str()).collect();
            Ok(acquired.iter().any(|t| {
                t.fire_instance_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(id))
            }))
        };
        self.execute_in_non_managed_tx_lock(
            lock,
            |ctx| self.acquire_next_triggers_in(ctx.conn(), no_later_than, max_count, time_window),
            Some(validator),
        )
    }

    fn acquire_next_triggers_in(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> Result<Vec<Trigger>> {
        let max_attempts = self.config.acquire_retry_count.max(1);
        let mut acquired: Vec<Trigger> = Vec::new();
        let mut non_concurrent_jobs: HashSet<Key> = HashSet::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let keys = self.delegate.select_triggers_to_acquire(
                conn,
                no_later_than + time_window,
                self.misfire_time(Utc::now()),
                max_count,
            )?;
            if keys.is_empty() {
                return Ok(acquired);
            }

            let mut batch_end = no_later_than;
            for key in keys {
                let Some(mut trigger) = self.delegate.select_trigger(conn, &key)? else {
                    continue;
                };
                let job = match self.delegate.select_job_detail(conn, &trigger.job_key) {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        warn!(trigger = %key, job = %trigger.job_key, "trigger references a missing job, setting it to ERROR");
                        self.delegate.update_trigger_state(conn, &key, TriggerState::Error)?;
                        continue;
                    }
                    Err(e) => {
                        warn!(trigger = %key, error = %e, "failed to load job, setting trigger to ERROR");
                        self.delegate.update_trigger_state(conn, &key, TriggerState::Error)?;
                        continue;
                    }
                };

                if job.concurrent_execution_disallowed && !non_concurrent_jobs.insert(job.key.clone()) {
                    continue;
                }

                let Some(next_fire) = trigger.next_fire_time else {
                    warn!(trigger = %key, "WAITING trigger has no next fire time, skipping");
                    continue;
                };
                if next_fire > batch_end {
                    break;
                }

                let claimed = self.delegate.update_trigger_state_from_other_state(
                    conn,
                    &key,
                    TriggerState::Acquired,
                    TriggerState::Waiting,
                )?;
                if claimed == 0 {
                    debug!(trigger = %key, "trigger claimed elsewhere");
                    continue;
                }

                trigger.fire_instance_id = Some(Uuid::now_v7().to_string());
                self.delegate.insert_fired_trigger(
                    conn,
                    &trigger,
                    TriggerState::Acquired,
                    None,
                    &self.instance_id,
                )?;

                if acquired.is_empty() {
                    batch_end = next_fire.max(Utc::now()) + time_window;
                }
                acquired.push(trigger);
                if acquired.len() >= max_count {
                    break;
                }
            }

            if acquired.is_empty() && attempts < max_attempts {
                continue;
            }
            debug!(count = acquired.len(), attempts, "acquired triggers");
            return Ok(acquired);
        }
    }

    /// Give back a trigger acquired but not fired: WAITING again, fired
    /// record gone.
    #[instrument(skip_all, fields(trigger = %trigger.key))]
    pub fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.retry_execute_in_non_managed_tx_lock(Some(LockName::TriggerAccess), |ctx| {
            let conn = ctx.conn();
            self.delegate.update_trigger_state_from_other_states(
                conn,
                &trigger.key,
                TriggerState::Waiting,
                &[TriggerState::Acquired, TriggerState::Blocked],
            )?;
            if let Some(id) = &trigger.fire_instance_id {
                self.delegate.delete_fired_trigger(conn, id)?;
            }
            Ok(())
        })
    }

    /// Turn acquired triggers into fires.
    ///
    /// Each result is the trigger's bundle, `None` when it is no longer
    /// fireable (state changed, job or calendar gone), or its own error.
    #[instrument(skip_all, fields(count = triggers.len()))]
    pub fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>> {
        let validator: Validator<'_, Vec<TriggerFiredResult>> = &|conn, results| {
            let records = self
                .delegate
                .select_instance_fired_triggers(conn, &self.instance_id)?;
            let executing: HashSet<&str> = records
                .iter()
                .filter(|r| r.state == TriggerState::Executing)
                .map(|r| r.fire_instance_id.as_str())
                .collect();
            Ok(results.iter().any(|result| match result {
                Ok(Some(bundle)) => bundle
                    .trigger
                    .fire_instance_id
                    .as_deref()
                    .is_some_and(|id| executing.contains(id)),
                _ => false,
            }))
        };

        self.execute_in_non_managed_tx_lock(
            Some(LockName::TriggerAccess),
            |ctx| {
                let mut results = Vec::with_capacity(triggers.len());
                for trigger in triggers {
                    let result = self.trigger_fired_in(ctx.conn(), trigger);
                    if let Err(e) = &result {
                        error!(trigger = %trigger.key, error = %e, "failed to fire trigger");
                    }
                    results.push(result);
                }
                Ok(results)
            },
            Some(validator),
        )
    }

    fn trigger_fired_in(&self, conn: &Connection, trigger: &Trigger) -> TriggerFiredResult {
        match self.delegate.select_trigger_state(conn, &trigger.key)? {
            Some(TriggerState::Acquired) => {}
            state => {
                debug!(trigger = %trigger.key, ?state, "trigger no longer acquired");
                return Ok(None);
            }
        }

        let job = match self.delegate.select_job_detail(conn, &trigger.job_key) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(trigger = %trigger.key, job = %trigger.job_key, "job of fired trigger is gone");
                return Ok(None);
            }
            Err(e) => {
                error!(trigger = %trigger.key, error = %e, "failed to load job, setting trigger to ERROR");
                self.delegate
                    .update_trigger_state(conn, &trigger.key, TriggerState::Error)?;
                return Err(e);
            }
        };

        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => match self.retrieve_calendar_in(conn, Some(name))? {
                Some(cal) => Some(cal),
                None => {
                    debug!(trigger = %trigger.key, calendar = name, "calendar of fired trigger is gone");
                    return Ok(None);
                }
            },
            None => None,
        };

        self.delegate.update_fired_trigger(
            conn,
            trigger,
            TriggerState::Executing,
            Some(&job),
            &self.instance_id,
        )?;

        let mut trigger = trigger.clone();
        let previous_fire_time = trigger.previous_fire_time;
        trigger.triggered(calendar.as_ref());

        let mut state = TriggerState::Waiting;
        let mut force = true;
        if job.concurrent_execution_disallowed {
            state = TriggerState::Blocked;
            force = false;
            for (new, old) in [
                (TriggerState::Blocked, TriggerState::Waiting),
                (TriggerState::Blocked, TriggerState::Acquired),
                (TriggerState::PausedBlocked, TriggerState::Paused),
            ] {
                self.delegate
                    .update_trigger_states_for_job_from_other_state(conn, &job.key, new, old)?;
            }
        }
        if trigger.next_fire_time.is_none() {
            state = TriggerState::Complete;
            force = true;
        }
        self.store_trigger_in(conn, &trigger, Some(&job), true, state, force, false)?;

        Ok(Some(TriggerFiredBundle {
            recovering: trigger.key.group == RECOVERING_JOBS_GROUP,
            fire_time: Utc::now(),
            scheduled_fire_time: trigger.previous_fire_time,
            previous_fire_time,
            next_fire_time: trigger.next_fire_time,
            job,
            trigger,
            calendar,
        }))
    }

    /// Record the end of a fire: apply `instruction`, unblock the job's other
    /// triggers, persist changed job data and drop the fired record.
    #[instrument(skip_all, fields(trigger = %trigger.key, instruction = ?instruction))]
    pub fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        self.retry_execute_in_non_managed_tx_lock(Some(LockName::TriggerAccess), |ctx| {
            self.triggered_job_complete_in(ctx, trigger, job, instruction)
        })
    }

    fn triggered_job_complete_in(
        &self,
        ctx: &mut TxContext<'_>,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let conn = ctx.conn();
        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // The job may have rescheduled its own trigger while running.
                    let stored = self.delegate.select_trigger(conn, &trigger.key)?;
                    if stored.is_some_and(|t| t.next_fire_time.is_none()) {
                        self.remove_trigger_in(conn, &trigger.key)?;
                    }
                } else {
                    self.remove_trigger_in(conn, &trigger.key)?;
                    ctx.signal_scheduling_change_on_commit(None);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.delegate
                    .update_trigger_state(conn, &trigger.key, TriggerState::Complete)?;
                ctx.signal_scheduling_change_on_commit(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!(trigger = %trigger.key, "trigger set to ERROR state");
                self.delegate
                    .update_trigger_state(conn, &trigger.key, TriggerState::Error)?;
                ctx.signal_scheduling_change_on_commit(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.delegate
                    .update_trigger_states_for_job(conn, &job.key, TriggerState::Complete)?;
                ctx.signal_scheduling_change_on_commit(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!(job = %job.key, "all triggers of job set to ERROR state");
                self.delegate
                    .update_trigger_states_for_job(conn, &job.key, TriggerState::Error)?;
                ctx.signal_scheduling_change_on_commit(None);
            }
            CompletedExecutionInstruction::NoInstruction
            | CompletedExecutionInstruction::ReExecuteJob => {}
        }

        if job.concurrent_execution_disallowed {
            self.delegate.update_trigger_states_for_job_from_other_state(
                conn,
                &job.key,
                TriggerState::Waiting,
                TriggerState::Blocked,
            )?;
            self.delegate.update_trigger_states_for_job_from_other_state(
                conn,
                &job.key,
                TriggerState::Paused,
                TriggerState::PausedBlocked,
            )?;
            ctx.signal_scheduling_change_on_commit(None);
        }

        if job.persist_data_after_execution && job.job_data.is_dirty() {
            self.delegate.update_job_data(conn, job)?;
        }

        if let Some(id) = &trigger.fire_instance_id {
            self.delegate.delete_fired_trigger(conn, id)?;
        }
        Ok(())
    }
}
