use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::{LockHandler, LockName, LockOwner};
use crate::db::rtp;
use crate::error::{JobStoreError, Result};

const UPDATE_LOCK: &str =
    "UPDATE {prefix}LOCKS SET LOCK_NAME = LOCK_NAME WHERE SCHED_NAME = ?1 AND LOCK_NAME = ?2";
const INSERT_LOCK: &str = "INSERT INTO {prefix}LOCKS (SCHED_NAME, LOCK_NAME) VALUES (?1, ?2)";

/// Cluster-wide lock: a write to the lock row inside the unit of work's
/// transaction. The database holds it until that transaction ends.
///
/// Waiting for a busy database happens when that transaction begins, so a
/// failure here is final.
pub struct RowLockSemaphore {
    sched_name: String,
    prefix: String,
    owned: Mutex<HashMap<LockOwner, HashSet<LockName>>>,
}

impl RowLockSemaphore {
    pub fn new(sched_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            sched_name: sched_name.into(),
            prefix: prefix.into(),
            owned: Mutex::new(HashMap::new()),
        }
    }

    fn owned(&self) -> MutexGuard<'_, HashMap<LockOwner, HashSet<LockName>>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_lock_owner(&self, owner: LockOwner, name: LockName) -> bool {
        self.owned()
            .get(&owner)
            .is_some_and(|names| names.contains(&name))
    }

    fn touch_lock_row(&self, conn: &Connection, name: LockName) -> Result<()> {
        let updated = conn
            .prepare_cached(&rtp(UPDATE_LOCK, &self.prefix))?
            .execute(params![self.sched_name, name.as_str()])?;
        if updated == 0 {
            conn.prepare_cached(&rtp(INSERT_LOCK, &self.prefix))?
                .execute(params![self.sched_name, name.as_str()])?;
        }
        Ok(())
    }
}

impl LockHandler for RowLockSemaphore {
    fn obtain(&self, conn: Option<&Connection>, owner: LockOwner, name: LockName) -> Result<bool> {
        if self.is_lock_owner(owner, name) {
            debug!(lock = %name, %owner, "lock already held by owner");
            return Ok(false);
        }
        let conn = conn.ok_or_else(|| JobStoreError::Lock {
            name: name.to_string(),
            reason: "row lock requires a connection".into(),
        })?;

        self.touch_lock_row(conn, name)
            .map_err(|e| JobStoreError::Lock {
                name: name.to_string(),
                reason: format!("failure obtaining lock row: {e}"),
            })?;

        self.owned().entry(owner).or_default().insert(name);
        debug!(lock = %name, %owner, "lock obtained");
        Ok(true)
    }

    fn release(&self, owner: LockOwner, name: LockName) {
        let mut owned = self.owned();
        let Some(names) = owned.get_mut(&owner).filter(|n| n.contains(&name)) else {
            warn!(lock = %name, %owner, "lock release attempted by non-owner");
            return;
        };
        names.remove(&name);
        if names.is_empty() {
            owned.remove(&owner);
        }
        debug!(lock = %name, %owner, "lock released");
    }

    fn requires_connection(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn semaphore() -> RowLockSemaphore {
        RowLockSemaphore::new("test", "T_")
    }

    #[test]
    fn first_obtain_inserts_lock_row() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn, "T_").unwrap();
        let sem = semaphore();
        let owner = LockOwner::next();
        assert!(sem.obtain(Some(&conn), owner, LockName::StateAccess).unwrap());
        assert!(!sem.obtain(Some(&conn), owner, LockName::StateAccess).unwrap());
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM T_LOCKS", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        sem.release(owner, LockName::StateAccess);
        assert!(!sem.is_lock_owner(owner, LockName::StateAccess));
    }

    #[test]
    fn missing_table_surfaces_lock_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let err = semaphore()
            .obtain(Some(&conn), LockOwner::next(), LockName::TriggerAccess)
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_FAILURE");
    }

    #[test]
    fn requires_a_connection() {
        let sem = semaphore();
        assert!(sem.requires_connection());
        assert!(sem
            .obtain(None, LockOwner::next(), LockName::TriggerAccess)
            .is_err());
    }
}
