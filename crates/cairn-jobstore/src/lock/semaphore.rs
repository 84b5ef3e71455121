use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::{debug, warn};

use super::{LockHandler, LockName, LockOwner};
use crate::error::Result;

#[derive(Default)]
struct LockTable {
    held: HashMap<LockName, LockOwner>,
    owned: HashMap<LockOwner, HashSet<LockName>>,
}

/// In-process lock manager: strict per-name mutual exclusion between owners.
#[derive(Default)]
pub struct SimpleSemaphore {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl SimpleSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_lock_owner(&self, owner: LockOwner, name: LockName) -> bool {
        self.table().held.get(&name) == Some(&owner)
    }

    pub fn is_held(&self, name: LockName) -> bool {
        self.table().held.contains_key(&name)
    }
}

impl LockHandler for SimpleSemaphore {
    fn obtain(&self, _conn: Option<&Connection>, owner: LockOwner, name: LockName) -> Result<bool> {
        let mut table = self.table();
        if table.held.get(&name) == Some(&owner) {
            debug!(lock = %name, %owner, "lock already held by owner");
            return Ok(false);
        }
        while table.held.contains_key(&name) {
            table = self
                .released
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        table.held.insert(name, owner);
        table.owned.entry(owner).or_default().insert(name);
        debug!(lock = %name, %owner, "lock obtained");
        Ok(true)
    }

    fn release(&self, owner: LockOwner, name: LockName) {
        let mut table = self.table();
        if table.held.get(&name) != Some(&owner) {
            warn!(lock = %name, %owner, "lock release attempted by non-owner");
            return;
        }
        table.held.remove(&name);
        if let Some(names) = table.owned.get_mut(&owner) {
            names.remove(&name);
            if names.is_empty() {
                table.owned.remove(&owner);
            }
        }
        debug!(lock = %name, %owner, "lock released");
        self.released.notify_all();
    }

    fn requires_connection(&self) -> bool {
        false
    }
}
