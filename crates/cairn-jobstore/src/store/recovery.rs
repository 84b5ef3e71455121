use std::sync::atomic::Ordering;

use rusqlite::Connection;
use tracing::{info, warn};

use super::JobStore;
use crate::error::Result;
use crate::lock::LockName;
use crate::types::{
    to_millis, FiredTriggerRecord, Key, MisfireInstruction, Schedule, Trigger, TriggerState,
    FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS, FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
    FAILED_JOB_ORIGINAL_TRIGGER_NAME, FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS,
    RECOVERING_JOBS_GROUP,
};

impl JobStore {
    /// Startup recovery for a non-clustered store.
    pub(super) fn recover_jobs(&self) -> Result<()> {
        self.execute_in_non_managed_tx_lock(
            Some(LockName::TriggerAccess),
            |ctx| self.recover_jobs_in(ctx.conn()),
            None,
        )
    }

    fn recover_jobs_in(&self, conn: &Connection) -> Result<()> {
        let mut freed = self.delegate.update_trigger_states_from_other_states(
            conn,
            TriggerState::Waiting,
            &[TriggerState::Acquired, TriggerState::Blocked],
        )?;
        freed += self.delegate.update_trigger_states_from_other_states(
            conn,
            TriggerState::Paused,
            &[TriggerState::PausedBlocked],
        )?;
        info!(count = freed, "freed triggers from 'acquired' / 'blocked' state");

        self.recover_misfired_jobs_in(conn, true)?;

        let records = self
            .delegate
            .select_instance_fired_triggers(conn, &self.instance_id)?;
        let mut recovered = 0;
        for rec in records.iter().filter(|r| r.job_requests_recovery) {
            let Some(job_key) = &rec.job_key else {
                continue;
            };
            if !self.delegate.job_exists(conn, job_key)? {
                warn!(job = %job_key, "cannot recover job that no longer exists");
                continue;
            }
            let trigger = self.recovery_trigger_for(conn, rec, job_key)?;
            self.store_trigger_in(conn, &trigger, None, false, TriggerState::Waiting, false, true)?;
            recovered += 1;
        }
        info!(count = recovered, "recovered jobs that were in progress at the last shutdown");

        let complete = self.delegate.select_triggers_in_state(conn, TriggerState::Complete)?;
        for key in &complete {
            self.remove_trigger_in(conn, key)?;
        }
        info!(count = complete.len(), "removed 'complete' triggers");

        let stale = self.delegate.delete_fired_triggers(conn)?;
        info!(count = stale, "removed stale fired trigger entries");
        Ok(())
    }

    /// One-shot trigger in the recovery group that re-runs the job of an
    /// interrupted fire at its original scheduled time. Its data map is the
    /// original trigger's plus the original key and fire times.
    pub(super) fn recovery_trigger_for(
        &self,
        conn: &Connection,
        rec: &FiredTriggerRecord,
        job_key: &Key,
    ) -> Result<Trigger> {
        let seq = self.recover_counter.fetch_add(1, Ordering::SeqCst);
        let mut data = self
            .delegate
            .select_trigger_job_data(conn, &rec.trigger_key)?
            .unwrap_or_default();
        data.put(FAILED_JOB_ORIGINAL_TRIGGER_NAME, rec.trigger_key.name.clone());
        data.put(FAILED_JOB_ORIGINAL_TRIGGER_GROUP, rec.trigger_key.group.clone());
        data.put(
            FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS,
            to_millis(rec.fired_timestamp).to_string(),
        );
        data.put(
            FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS,
            to_millis(rec.scheduled_timestamp).to_string(),
        );

        Ok(Trigger::new(
            Key::new(
                format!("recover_{}_{seq}", rec.instance_id),
                RECOVERING_JOBS_GROUP,
            ),
            job_key.clone(),
            Schedule::once(),
            rec.scheduled_timestamp,
        )
        .with_priority(rec.priority)
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy)
        .with_data(data))
    }
}
