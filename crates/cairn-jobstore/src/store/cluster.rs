use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use super::JobStore;
use crate::error::{JobStoreError, Result};
use crate::lock::LockName;
use crate::types::{from_millis, to_millis, SchedulerStateRecord, TriggerState};

const MIN_CHECKIN_SLEEP: Duration = Duration::from_millis(100);

impl JobStore {
    /// Refresh this instance's heartbeat and recover any peers found dead.
    /// Returns whether anything was recovered.
    ///
    /// The heartbeat runs on an auto-commit connection, so it holds the
    /// database write lock only for its own update; `STATE_ACCESS` (and then
    /// `TRIGGER_ACCESS`) is only taken when there is something to recover,
    /// and on the very first check-in.
    pub fn check_in(&self) -> Result<bool> {
        let first = self.first_checkin.load(Ordering::SeqCst);

        let mut failed = Vec::new();
        if !first {
            failed = self.read(|conn| self.cluster_checkin(conn))?;
        }

        let mut recovered = false;
        if first || !failed.is_empty() {
            recovered = self.execute_in_non_managed_tx_lock(
                Some(LockName::StateAccess),
                |ctx| {
                    // Re-read under the lock: a peer may have recovered them already.
                    let failed = if first {
                        self.cluster_checkin(ctx.conn())?
                    } else {
                        self.find_failed_instances(ctx.conn())?
                    };
                    if failed.is_empty() {
                        return Ok(false);
                    }
                    ctx.obtain_lock(LockName::TriggerAccess)?;
                    self.cluster_recover(ctx.conn(), &failed)?;
                    Ok(true)
                },
                None,
            )?;
        }

        self.first_checkin.store(false, Ordering::SeqCst);
        Ok(recovered)
    }

    fn cluster_checkin(&self, conn: &Connection) -> Result<Vec<SchedulerStateRecord>> {
        let failed = self.find_failed_instances(conn)?;
        let now = Utc::now();
        self.last_checkin.store(to_millis(now), Ordering::SeqCst);
        if self
            .delegate
            .update_scheduler_state(conn, &self.instance_id, now)?
            == 0
        {
            self.delegate.insert_scheduler_state(
                conn,
                &self.instance_id,
                now,
                self.config.cluster_checkin_interval_ms as i64,
            )?;
        }
        Ok(failed)
    }

    /// Peers whose heartbeat is overdue, this instance's own leftovers on
    /// the first check-in, and (also on the first check-in) instances that
    /// own fired records but have no state row at all.
    fn find_failed_instances(&self, conn: &Connection) -> Result<Vec<SchedulerStateRecord>> {
        let first = self.first_checkin.load(Ordering::SeqCst);
        let now = Utc::now();
        let states = self.delegate.select_scheduler_state_records(conn, None)?;

        let mut failed = Vec::new();
        let mut found_self = false;
        for rec in &states {
            if rec.instance_id == self.instance_id {
                found_self = true;
                if first {
                    failed.push(rec.clone());
                }
            } else if self.failed_if_after(rec) < to_millis(now) {
                failed.push(rec.clone());
            }
        }

        if first {
            let known: HashSet<&str> = states.iter().map(|s| s.instance_id.as_str()).collect();
            let mut orphans: Vec<String> = self
                .delegate
                .select_fired_trigger_instance_names(conn)?
                .into_iter()
                .filter(|name| !known.contains(name.as_str()))
                .collect();
            orphans.sort();
            for instance_id in orphans {
                warn!(instance = %instance_id, "found orphaned fired triggers for an unknown instance");
                failed.push(SchedulerStateRecord {
                    instance_id,
                    checkin_timestamp: from_millis(0),
                    checkin_interval_ms: 0,
                });
            }
        }

        if !found_self && !first {
            warn!(
                instance = %self.instance_id,
                "this instance is still active but was recovered by another instance in the cluster"
            );
        }
        Ok(failed)
    }

    /// Epoch millis after which `rec` counts as failed: its last check-in plus
    /// the longer of its interval and our own gap since checking in, plus
    /// the grace period.
    fn failed_if_after(&self, rec: &SchedulerStateRecord) -> i64 {
        let since_own = to_millis(Utc::now()) - self.last_checkin.load(Ordering::SeqCst);
        to_millis(rec.checkin_timestamp)
            + rec.checkin_interval_ms.max(since_own)
            + self.config.cluster_failure_grace_ms as i64
    }

    fn cluster_recover(&self, conn: &Connection, failed: &[SchedulerStateRecord]) -> Result<()> {
        for rec in failed {
            info!(
                instance = %rec.instance_id,
                last_checkin = %rec.checkin_timestamp,
                "recovering failed scheduler instance"
            );
            let fired = self
                .delegate
                .select_instance_fired_triggers(conn, &rec.instance_id)?;

            let (mut acquired, mut recovered, mut other) = (0usize, 0usize, 0usize);
            let mut trigger_keys = HashSet::new();
            for ft in &fired {
                trigger_keys.insert(ft.trigger_key.clone());

                match (&ft.job_key, ft.state) {
                    (Some(job_key), TriggerState::Blocked) => {
                        self.delegate.update_trigger_states_for_job_from_other_state(
                            conn,
                            job_key,
                            TriggerState::Waiting,
                            TriggerState::Blocked,
                        )?;
                    }
                    (Some(job_key), TriggerState::PausedBlocked) => {
                        self.delegate.update_trigger_states_for_job_from_other_state(
                            conn,
                            job_key,
                            TriggerState::Paused,
                            TriggerState::PausedBlocked,
                        )?;
                    }
                    _ => {}
                }

                if ft.state == TriggerState::Acquired {
                    self.delegate.update_trigger_state_from_other_state(
                        conn,
                        &ft.trigger_key,
                        TriggerState::Waiting,
                        TriggerState::Acquired,
                    )?;
                    acquired += 1;
                } else if ft.job_requests_recovery {
                    match &ft.job_key {
                        Some(job_key) if self.delegate.job_exists(conn, job_key)? => {
                            let trigger = self.recovery_trigger_for(conn, ft, job_key)?;
                            self.store_trigger_in(
                                conn,
                                &trigger,
                                None,
                                false,
                                TriggerState::Waiting,
                                false,
                                true,
                            )?;
                            recovered += 1;
                        }
                        _ => {
                            warn!(
                                trigger = %ft.trigger_key,
                                "cannot recover job of fired trigger, the job no longer exists"
                            );
                            other += 1;
                        }
                    }
                } else {
                    other += 1;
                }

                if let (true, Some(job_key)) = (ft.job_disallows_concurrent_execution, &ft.job_key) {
                    self.delegate.update_trigger_states_for_job_from_other_state(
                        conn,
                        job_key,
                        TriggerState::Waiting,
                        TriggerState::Blocked,
                    )?;
                    self.delegate.update_trigger_states_for_job_from_other_state(
                        conn,
                        job_key,
                        TriggerState::Paused,
                        TriggerState::PausedBlocked,
                    )?;
                }
            }

            self.delegate
                .delete_instance_fired_triggers(conn, &rec.instance_id)?;

            let mut removed_complete = 0;
            for key in &trigger_keys {
                let complete =
                    self.delegate.select_trigger_state(conn, key)? == Some(TriggerState::Complete);
                if complete
                    && self.delegate.select_fired_triggers_for_trigger(conn, key)?.is_empty()
                    && self.remove_trigger_in(conn, key)?
                {
                    removed_complete += 1;
                }
            }

            if acquired + recovered + other + removed_complete > 0 {
                info!(
                    instance = %rec.instance_id,
                    acquired,
                    recovered,
                    other,
                    removed_complete,
                    "recovered fired triggers of failed instance"
                );
            }

            if rec.instance_id != self.instance_id {
                self.delegate.delete_scheduler_state(conn, &rec.instance_id)?;
            }
        }
        Ok(())
    }

    pub(super) fn spawn_cluster_manager(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let store = Arc::clone(self);
        self.spawn_monitor("ClusterManager", move || store.run_cluster_manager())
    }

    fn run_cluster_manager(&self) {
        info!("cluster manager started");
        let interval = self.config.cluster_checkin_interval();
        let mut failures: u64 = 0;

        loop {
            let since = to_millis(Utc::now()) - self.last_checkin.load(Ordering::SeqCst);
            let since = Duration::from_millis(since.max(0) as u64);
            let mut sleep = interval.saturating_sub(since);
            if sleep.is_zero() {
                sleep = MIN_CHECKIN_SLEEP;
            }
            if failures > 0 {
                sleep = sleep.max(self.config.db_retry_interval());
            }
            if self.shutdown.wait(sleep) {
                break;
            }

            match self.check_in() {
                Ok(recovered) => {
                    failures = 0;
                    if recovered {
                        self.signaler.notify_scheduling_change(None);
                    }
                }
                Err(JobStoreError::ShuttingDown) => break,
                Err(e) => {
                    failures += 1;
                    if failures % 4 == 1 {
                        error!(error = %e, failures, "cluster check-in failed");
                    } else {
                        debug!(error = %e, failures, "cluster check-in failed");
                    }
                }
            }
        }
        info!("cluster manager stopped");
    }
}
