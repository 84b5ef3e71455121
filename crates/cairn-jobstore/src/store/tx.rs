use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use super::JobStore;
use crate::ambient::AmbientTransaction;
use crate::connection::ConnectionGuard;
use crate::error::{JobStoreError, Result};
use crate::lock::{LockHandler, LockName, LockOwner};

/// Pending scheduling-change signal: `Some(None)` means "immediately".
type PendingSignal = Option<Option<DateTime<Utc>>>;

/// Checks, after a failed commit, whether the unit's effects are visible anyway.
pub(crate) type Validator<'v, T> = &'v dyn Fn(&Connection, &T) -> Result<bool>;

/// State of one unit of work: its connection, lock owner and the signal to
/// deliver once it commits.
pub(crate) struct TxContext<'a> {
    conn: &'a Connection,
    owner: LockOwner,
    locks: &'a dyn LockHandler,
    escalated: Vec<LockName>,
    signal: PendingSignal,
}

impl<'a> TxContext<'a> {
    pub(crate) fn conn(&self) -> &'a Connection {
        self.conn
    }

    /// Take another lock mid-unit. Released with the unit's own lock.
    pub(crate) fn obtain_lock(&mut self, name: LockName) -> Result<()> {
        if self.locks.obtain(Some(self.conn), self.owner, name)? {
            self.escalated.push(name);
        }
        Ok(())
    }

    /// Ask for a scheduling-change signal after commit. The earliest
    /// candidate wins; `None` dominates everything.
    pub(crate) fn signal_scheduling_change_on_commit(&mut self, candidate: Option<DateTime<Utc>>) {
        self.signal = Some(match (self.signal, candidate) {
            (None, c) => c,
            (Some(None), _) | (Some(_), None) => None,
            (Some(Some(a)), Some(b)) => Some(a.min(b)),
        });
    }
}

/// Errors that another attempt cannot fix are returned straight away.
fn worth_retrying(e: &JobStoreError) -> bool {
    matches!(
        e,
        JobStoreError::Database(_) | JobStoreError::Lock { .. } | JobStoreError::Persistence(_)
    )
}

impl JobStore {
    fn begin_connection(&self) -> Result<ConnectionGuard> {
        let mut conn = self.provider.connection()?;
        conn.set_auto_commit(false)?;
        Ok(conn)
    }

    /// Begin the transaction a row lock rides on. A busy database is retried
    /// `lock_retry_count` times, `lock_retry_period` apart, before the lock
    /// counts as failed.
    fn begin_locked_connection(&self, name: LockName) -> Result<ConnectionGuard> {
        let mut attempt = 0;
        loop {
            match self.begin_connection() {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_transient() && attempt < self.config.lock_retry_count => {
                    attempt += 1;
                    debug!(lock = %name, attempt, error = %e, "database busy, retrying lock");
                    if self.shutdown.wait(self.config.lock_retry_period()) {
                        return Err(JobStoreError::ShuttingDown);
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(JobStoreError::Lock {
                        name: name.to_string(),
                        reason: format!("database still busy after {} attempts: {e}", attempt + 1),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn run_work<T, F>(
        &self,
        conn: &Connection,
        owner: LockOwner,
        taken: &mut Vec<LockName>,
        work: F,
    ) -> Result<(T, PendingSignal)>
    where
        F: FnOnce(&mut TxContext<'_>) -> Result<T>,
    {
        let mut ctx = TxContext {
            conn,
            owner,
            locks: self.locks.as_ref(),
            escalated: Vec::new(),
            signal: None,
        };
        let outcome = work(&mut ctx);
        taken.extend(ctx.escalated);
        outcome.map(|value| (value, ctx.signal))
    }

    /// Self-managed unit of work: begin, lock, run, commit or roll back,
    /// release, close. Signals raised by the unit go out after commit.
    pub(crate) fn execute_in_non_managed_tx_lock<T, F>(
        &self,
        lock: Option<LockName>,
        work: F,
        validator: Option<Validator<'_, T>>,
    ) -> Result<T>
    where
        F: FnOnce(&mut TxContext<'_>) -> Result<T>,
    {
        let owner = LockOwner::next();
        let mut slot = None;
        let mut taken = Vec::new();
        let outcome = self.run_non_managed(owner, lock, &mut slot, &mut taken, work, validator);

        for name in taken.into_iter().rev() {
            self.locks.release(owner, name);
        }
        drop(slot);

        let (value, signal) = outcome?;
        if let Some(candidate) = signal {
            self.signaler.notify_scheduling_change(candidate);
        }
        Ok(value)
    }

    fn run_non_managed<T, F>(
        &self,
        owner: LockOwner,
        lock: Option<LockName>,
        slot: &mut Option<ConnectionGuard>,
        taken: &mut Vec<LockName>,
        work: F,
        validator: Option<Validator<'_, T>>,
    ) -> Result<(T, PendingSignal)>
    where
        F: FnOnce(&mut TxContext<'_>) -> Result<T>,
    {
        if let Some(name) = lock.filter(|_| self.locks.requires_connection()) {
            *slot = Some(self.begin_locked_connection(name)?);
        }
        if let Some(name) = lock {
            if self.locks.obtain(slot.as_deref(), owner, name)? {
                taken.push(name);
            }
        }
        let guard: &ConnectionGuard = match slot.take() {
            Some(existing) => slot.insert(existing),
            None => slot.insert(self.begin_connection()?),
        };

        let (value, signal) = match self.run_work(guard, owner, taken, work) {
            Ok(done) => done,
            Err(e) => {
                if let Err(rb) = guard.rollback() {
                    warn!(error = %rb, "rollback failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = guard.commit() {
            if let Err(rb) = guard.rollback() {
                warn!(error = %rb, "rollback after failed commit failed");
            }
            let value = self.settle_failed_commit(e, value, validator)?;
            return Ok((value, signal));
        }
        Ok((value, signal))
    }

    /// A commit reported `error`. Keep `value` only if `validator` confirms,
    /// in a fresh retried transaction, that the unit's effects are visible.
    fn settle_failed_commit<T>(
        &self,
        error: JobStoreError,
        value: T,
        validator: Option<Validator<'_, T>>,
    ) -> Result<T> {
        let Some(validate) = validator else {
            return Err(error);
        };
        if self.confirm_commit(validate, &value)? {
            info!(error = %error, "commit reported failure but its effects are visible");
            Ok(value)
        } else {
            Err(error)
        }
    }

    /// Not generic over the unit's closure type, so the executor does not
    /// instantiate itself again for the validation unit.
    fn confirm_commit<T>(&self, validate: Validator<'_, T>, value: &T) -> Result<bool> {
        let work: &dyn Fn(&mut TxContext<'_>) -> Result<bool> = &|ctx| validate(ctx.conn(), value);
        self.retry_execute_in_non_managed_tx_lock(None, work)
    }

    /// Repeat a self-managed unit until it succeeds, sleeping
    /// `db_retry_interval` between attempts. Gives up once shutdown starts.
    pub(crate) fn retry_execute_in_non_managed_tx_lock<T, F>(
        &self,
        lock: Option<LockName>,
        work: F,
    ) -> Result<T>
    where
        F: Fn(&mut TxContext<'_>) -> Result<T>,
    {
        let mut failures: u64 = 0;
        loop {
            if self.shutdown.is_triggered() {
                return Err(JobStoreError::ShuttingDown);
            }
            match self.execute_in_non_managed_tx_lock(lock, &work, None) {
                Ok(value) => return Ok(value),
                Err(e) if !worth_retrying(&e) => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures % 4 == 1 {
                        error!(error = %e, failures, "store operation failed, will retry");
                    } else {
                        debug!(error = %e, failures, "store operation failed, will retry");
                    }
                    if self.shutdown.wait(self.config.db_retry_interval()) {
                        return Err(JobStoreError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Unit of work inside an externally managed transaction: never commits
    /// or rolls back. Lock releases may be deferred to its completion, and
    /// scheduling-change signals go out only if it commits.
    ///
    /// `owner` should live as long as the transaction so repeated calls
    /// re-enter locks whose release is still pending.
    pub(crate) fn execute_in_managed_lock<T, F>(
        &self,
        tx: &Arc<dyn AmbientTransaction>,
        owner: LockOwner,
        lock: Option<LockName>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut TxContext<'_>) -> Result<T>,
    {
        self.locks.bind_transaction(owner, tx);
        let mut taken = Vec::new();
        let outcome = {
            let conn = tx.connection();
            let locked = match lock {
                Some(name) => self.locks.obtain(Some(&**conn), owner, name).map(|newly| {
                    if newly {
                        taken.push(name);
                    }
                }),
                None => Ok(()),
            };
            locked.and_then(|()| self.run_work(&conn, owner, &mut taken, work))
        };
        for name in taken.into_iter().rev() {
            self.locks.release(owner, name);
        }
        self.locks.unbind_transaction(owner);

        let (value, signal) = outcome?;
        if let Some(candidate) = signal {
            let signaler = Arc::clone(&self.signaler);
            tx.register_completion(Box::new(move |committed| {
                if committed {
                    signaler.notify_scheduling_change(candidate);
                }
            }));
        }
        Ok(value)
    }
}
