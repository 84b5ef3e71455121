use std::sync::Arc;

use tracing::instrument;

use super::JobStore;
use crate::ambient::AmbientTransaction;
use crate::error::Result;
use crate::lock::{LockName, LockOwner};
use crate::types::{JobDetail, Key, Trigger, TriggerState};

/// Storage operations that join a transaction owned by the caller.
///
/// Nothing here commits or rolls back; locks taken through a
/// transaction-bound handler are held until the caller finishes the
/// transaction.
pub struct ManagedJobStore<'s> {
    store: &'s JobStore,
    tx: Arc<dyn AmbientTransaction>,
    owner: LockOwner,
}

impl JobStore {
    pub fn in_transaction(&self, tx: Arc<dyn AmbientTransaction>) -> ManagedJobStore<'_> {
        ManagedJobStore {
            store: self,
            tx,
            owner: LockOwner::next(),
        }
    }
}

impl ManagedJobStore<'_> {
    #[instrument(skip_all, fields(job = %job.key))]
    pub fn store_job(&self, job: &JobDetail, replace: bool) -> Result<()> {
        self.store
            .execute_in_managed_lock(&self.tx, self.owner, Some(LockName::TriggerAccess), |ctx| {
                self.store.store_job_in(ctx.conn(), job, replace)
            })
    }

    #[instrument(skip_all, fields(trigger = %trigger.key))]
    pub fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<()> {
        self.store
            .execute_in_managed_lock(&self.tx, self.owner, Some(LockName::TriggerAccess), |ctx| {
                self.store.store_trigger_in(
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

    pub fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
        self.store
            .execute_in_managed_lock(&self.tx, self.owner, Some(LockName::TriggerAccess), |ctx| {
                self.store.store_job_in(ctx.conn(), job, false)?;
                self.store.store_trigger_in(
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

    pub fn remove_trigger(&self, key: &Key) -> Result<bool> {
        self.store
            .execute_in_managed_lock(&self.tx, self.owner, Some(LockName::TriggerAccess), |ctx| {
                self.store.remove_trigger_in(ctx.conn(), key)
            })
    }

    pub fn remove_job(&self, key: &Key) -> Result<bool> {
        self.store
            .execute_in_managed_lock(&self.tx, self.owner, Some(LockName::TriggerAccess), |ctx| {
                self.store.remove_job_in(ctx.conn(), key)
            })
    }
}
