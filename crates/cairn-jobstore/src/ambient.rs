//! Externally managed transactions.
//!
//! The managed store flavor never begins, commits or rolls back on its own:
//! it borrows the connection of an [`AmbientTransaction`] owned by the caller
//! and hooks lock releases onto that transaction's completion.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::connection::{ConnectionGuard, ConnectionProvider};
use crate::error::Result;

/// Invoked once when the transaction ends; the flag is `true` on commit.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

pub trait AmbientTransaction: Send + Sync {
    /// The transaction's connection, exclusive for the guard's lifetime.
    fn connection(&self) -> MutexGuard<'_, ConnectionGuard>;

    fn register_completion(&self, callback: CompletionCallback);
}

/// A transaction opened on a provider connection and finished by hand.
pub struct LocalTransaction {
    conn: Mutex<ConnectionGuard>,
    callbacks: Mutex<Vec<CompletionCallback>>,
}

impl LocalTransaction {
    pub fn begin(provider: &dyn ConnectionProvider) -> Result<Arc<Self>> {
        let mut conn = provider.connection()?;
        conn.set_auto_commit(false)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            callbacks: Mutex::new(Vec::new()),
        }))
    }

    pub fn commit(&self) -> Result<()> {
        let result = self.connection().commit();
        self.complete(result.is_ok());
        result
    }

    pub fn rollback(&self) -> Result<()> {
        let result = self.connection().rollback();
        self.complete(false);
        result
    }

    fn complete(&self, committed: bool) {
        let callbacks: Vec<_> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        debug!(committed, callbacks = callbacks.len(), "transaction completed");
        for callback in callbacks {
            callback(committed);
        }
    }
}

impl AmbientTransaction for LocalTransaction {
    fn connection(&self) -> MutexGuard<'_, ConnectionGuard> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_completion(&self, callback: CompletionCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}
