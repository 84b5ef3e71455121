use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, error, info};

use super::JobStore;
use crate::error::{JobStoreError, Result};
use crate::lock::LockName;
use crate::types::{MisfireInstruction, Trigger, TriggerState};

const MIN_MISFIRE_SLEEP: Duration = Duration::from_millis(50);

/// Outcome of one misfire sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverMisfiredResult {
    /// The batch limit was hit; another sweep should follow right away.
    pub has_more_misfired_triggers: bool,
    pub processed_misfired_trigger_count: usize,
    pub earliest_new_time: Option<DateTime<Utc>>,
}

impl RecoverMisfiredResult {
    pub const NO_OP: Self = Self {
        has_more_misfired_triggers: false,
        processed_misfired_trigger_count: 0,
        earliest_new_time: None,
    };
}

impl JobStore {
    /// Apply the trigger's misfire instruction and store the result: COMPLETE
    /// (with a finalized notification) when it will never fire again,
    /// otherwise `new_state`.
    pub(super) fn do_update_of_misfired_trigger(
        &self,
        conn: &Connection,
        mut trigger: Trigger,
        force_state: bool,
        new_state: TriggerState,
        recovering: bool,
        now: DateTime<Utc>,
    ) -> Result<Trigger> {
        let calendar = self.retrieve_calendar_in(conn, trigger.calendar_name.as_deref())?;
        self.signaler.notify_trigger_misfired(&trigger);
        trigger.update_after_misfire(calendar.as_ref(), now);

        if trigger.next_fire_time.is_none() {
            self.store_trigger_in(
                conn,
                &trigger,
                None,
                true,
                TriggerState::Complete,
                force_state,
                recovering,
            )?;
            self.signaler.notify_finalized(&trigger);
        } else {
            self.store_trigger_in(conn, &trigger, None, true, new_state, force_state, recovering)?;
        }
        Ok(trigger)
    }

    /// Handle `trigger` as misfired if it is past the threshold and does not
    /// ignore misfires. Returns whether it was.
    pub(super) fn update_misfired_trigger(
        &self,
        conn: &Connection,
        trigger: Trigger,
        new_state: TriggerState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if trigger.misfire_instruction == MisfireInstruction::IgnoreMisfirePolicy {
            return Ok(false);
        }
        let misfire_time = self.misfire_time(now);
        match trigger.next_fire_time {
            Some(next) if next <= misfire_time => {
                self.do_update_of_misfired_trigger(conn, trigger, true, new_state, false, now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// One sweep over WAITING triggers past the threshold. Startup recovery
    /// (`recovering`) handles all of them; otherwise at most
    /// `max_misfires_to_handle_at_a_time`.
    pub(super) fn recover_misfired_jobs_in(
        &self,
        conn: &Connection,
        recovering: bool,
    ) -> Result<RecoverMisfiredResult> {
        let limit = if recovering {
            None
        } else {
            Some(self.config.max_misfires_to_handle_at_a_time)
        };
        let now = Utc::now();
        let (keys, has_more) = self.delegate.select_misfired_triggers_in_state(
            conn,
            TriggerState::Waiting,
            self.misfire_time(now),
            limit,
        )?;

        if has_more {
            info!(
                count = keys.len(),
                "handling the first batch of triggers that missed their scheduled fire-time, more remain"
            );
        } else if !keys.is_empty() {
            info!(count = keys.len(), "handling triggers that missed their scheduled fire-time");
        } else {
            debug!("found 0 triggers that missed their scheduled fire-time");
            return Ok(RecoverMisfiredResult::NO_OP);
        }

        let mut earliest: Option<DateTime<Utc>> = None;
        let mut processed = 0;
        for key in &keys {
            let Some(trigger) = self.delegate.select_trigger(conn, key)? else {
                continue;
            };
            let trigger = self.do_update_of_misfired_trigger(
                conn,
                trigger,
                false,
                TriggerState::Waiting,
                recovering,
                now,
            )?;
            if let Some(next) = trigger.next_fire_time {
                earliest = Some(earliest.map_or(next, |e| e.min(next)));
            }
            processed += 1;
        }

        Ok(RecoverMisfiredResult {
            has_more_misfired_triggers: has_more,
            processed_misfired_trigger_count: processed,
            earliest_new_time: earliest,
        })
    }

    /// Run one misfire sweep now, as the misfire thread would.
    pub fn recover_misfires(&self) -> Result<RecoverMisfiredResult> {
        if self.config.double_check_lock_misfire_handler {
            let count = self.read(|conn| {
                self.delegate.count_misfired_triggers_in_state(
                    conn,
                    TriggerState::Waiting,
                    self.misfire_time(Utc::now()),
                )
            })?;
            if count == 0 {
                debug!("found 0 triggers that missed their scheduled fire-time");
                return Ok(RecoverMisfiredResult::NO_OP);
            }
        }

        self.execute_in_non_managed_tx_lock(
            Some(LockName::TriggerAccess),
            |ctx| {
                let result = self.recover_misfired_jobs_in(ctx.conn(), false)?;
                if result.processed_misfired_trigger_count > 0 {
                    ctx.signal_scheduling_change_on_commit(result.earliest_new_time);
                }
                Ok(result)
            },
            None,
        )
    }

    pub(super) fn spawn_misfire_handler(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let store = Arc::clone(self);
        self.spawn_monitor("MisfireHandler", move || store.run_misfire_handler())
    }

    fn run_misfire_handler(&self) {
        info!("misfire handler started");
        let threshold = self.config.misfire_threshold();
        let mut failures: u64 = 0;

        loop {
            let started = Instant::now();
            let mut has_more = false;

            if !self.is_paused() {
                match self.recover_misfires() {
                    Ok(result) => {
                        failures = 0;
                        has_more = result.has_more_misfired_triggers;
                    }
                    Err(JobStoreError::ShuttingDown) => break,
                    Err(e) => {
                        failures += 1;
                        if failures % 4 == 1 {
                            error!(error = %e, failures, "misfire handler sweep failed");
                        } else {
                            debug!(error = %e, failures, "misfire handler sweep failed");
                        }
                    }
                }
            }

            let mut sleep = if has_more {
                MIN_MISFIRE_SLEEP
            } else {
                threshold
                    .saturating_sub(started.elapsed())
                    .max(MIN_MISFIRE_SLEEP)
            };
            if failures > 0 {
                sleep = sleep.max(self.config.db_retry_interval());
            }
            if self.shutdown.wait(sleep) {
                break;
            }
        }
        info!("misfire handler stopped");
    }
}
