//! Named locks serializing trigger and cluster-state mutations.
//!
//! Owners are explicit [`LockOwner`] handles minted per unit of work, so a
//! lock can be released by whichever thread finishes that unit.

mod deferred;
mod row;
mod semaphore;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::Connection;

use crate::ambient::AmbientTransaction;
use crate::error::Result;

pub use deferred::TransactionBoundSemaphore;
pub use row::RowLockSemaphore;
pub use semaphore::SimpleSemaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockName {
    /// Guards trigger state transitions.
    TriggerAccess,
    /// Guards cluster check-in and failover.
    StateAccess,
}

impl LockName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::TriggerAccess => "TRIGGER_ACCESS",
            LockName::StateAccess => "STATE_ACCESS",
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the unit of work holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl LockOwner {
    pub fn next() -> Self {
        LockOwner(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

pub trait LockHandler: Send + Sync {
    /// Block until `owner` holds `name`. Re-entrant for the same owner.
    ///
    /// Returns `true` when the lock was newly taken (and so must be released).
    fn obtain(&self, conn: Option<&Connection>, owner: LockOwner, name: LockName) -> Result<bool>;

    /// Release `name`; a no-op (logged) when `owner` does not hold it.
    fn release(&self, owner: LockOwner, name: LockName);

    /// The lock is taken through the unit of work's own connection.
    fn requires_connection(&self) -> bool;

    /// Tie `owner` to an externally managed transaction.
    fn bind_transaction(&self, _owner: LockOwner, _tx: &Arc<dyn AmbientTransaction>) {}

    fn unbind_transaction(&self, _owner: LockOwner) {}
}
