use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::debug;

use super::{LockHandler, LockName, LockOwner, SimpleSemaphore};
use crate::ambient::AmbientTransaction;
use crate::error::Result;

/// In-process locks whose release waits for a bound external transaction.
///
/// Releasing while bound registers the real release as a completion
/// callback, so the lock spans the caller's transaction rather than just the
/// store call.
pub struct TransactionBoundSemaphore {
    inner: Arc<SimpleSemaphore>,
    bound: Mutex<HashMap<LockOwner, Arc<dyn AmbientTransaction>>>,
}

impl TransactionBoundSemaphore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimpleSemaphore::new()),
            bound: Mutex::new(HashMap::new()),
        }
    }

    fn bound(&self) -> MutexGuard<'_, HashMap<LockOwner, Arc<dyn AmbientTransaction>>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_lock_owner(&self, owner: LockOwner, name: LockName) -> bool {
        self.inner.is_lock_owner(owner, name)
    }
}

impl Default for TransactionBoundSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockHandler for TransactionBoundSemaphore {
    fn obtain(&self, conn: Option<&Connection>, owner: LockOwner, name: LockName) -> Result<bool> {
        self.inner.obtain(conn, owner, name)
    }

    fn release(&self, owner: LockOwner, name: LockName) {
        let tx = self.bound().get(&owner).cloned();
        match tx {
            Some(tx) => {
                debug!(lock = %name, %owner, "deferring lock release to transaction completion");
                let inner = Arc::clone(&self.inner);
                tx.register_completion(Box::new(move |_| inner.release(owner, name)));
            }
            None => self.inner.release(owner, name),
        }
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn bind_transaction(&self, owner: LockOwner, tx: &Arc<dyn AmbientTransaction>) {
        self.bound().insert(owner, Arc::clone(tx));
    }

    fn unbind_transaction(&self, owner: LockOwner) {
        self.bound().remove(&owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::LocalTransaction;
    use crate::connection::SqliteConnectionProvider;
    use std::time::Duration;

    #[test]
    fn release_waits_for_commit() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = SqliteConnectionProvider::new(dir.path().join("d.db"), Duration::from_secs(1));
        let local = LocalTransaction::begin(&provider).unwrap();
        let tx: Arc<dyn AmbientTransaction> = local.clone();

        let sem = TransactionBoundSemaphore::new();
        let owner = LockOwner::next();
        sem.bind_transaction(owner, &tx);
        sem.obtain(None, owner, LockName::TriggerAccess).unwrap();
        sem.release(owner, LockName::TriggerAccess);
        sem.unbind_transaction(owner);
        assert!(sem.is_lock_owner(owner, LockName::TriggerAccess));

        local.commit().unwrap();
        assert!(!sem.is_lock_owner(owner, LockName::TriggerAccess));
    }

    #[test]
    fn unbound_release_is_immediate() {
        let sem = TransactionBoundSemaphore::new();
        let owner = LockOwner::next();
        sem.obtain(None, owner, LockName::StateAccess).unwrap();
        sem.release(owner, LockName::StateAccess);
        assert!(!sem.is_lock_owner(owner, LockName::StateAccess));
    }
}
