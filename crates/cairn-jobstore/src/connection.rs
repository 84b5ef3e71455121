//! Connection acquisition and the scoped attribute guard.

use std::ops::Deref;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use tracing::warn;

use crate::error::Result;

/// Hands out connections to the job-store database.
pub trait ConnectionProvider: Send + Sync {
    fn connection(&self) -> Result<ConnectionGuard>;
}

/// Opens a fresh SQLite connection per unit of work.
pub struct SqliteConnectionProvider {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnectionProvider {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl ConnectionProvider for SqliteConnectionProvider {
    fn connection(&self) -> Result<ConnectionGuard> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(ConnectionGuard::new(conn))
    }
}

#[derive(Debug, Clone, Copy)]
struct Attributes {
    auto_commit: bool,
    read_uncommitted: bool,
}

/// Owns a connection for one unit of work.
///
/// The first change to auto-commit or isolation records the original values.
/// On drop any open transaction is rolled back, the attributes are restored
/// and the connection closes.
pub struct ConnectionGuard {
    conn: Connection,
    original: Option<Attributes>,
}

impl ConnectionGuard {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            original: None,
        }
    }

    fn snapshot(&mut self) -> Result<()> {
        if self.original.is_none() {
            self.original = Some(Attributes {
                auto_commit: self.conn.is_autocommit(),
                read_uncommitted: self.read_uncommitted()?,
            });
        }
        Ok(())
    }

    fn read_uncommitted(&self) -> Result<bool> {
        let value: i64 = self
            .conn
            .pragma_query_value(None, "read_uncommitted", |row| row.get(0))?;
        Ok(value != 0)
    }

    /// Turning auto-commit off opens an immediate (write-locking) transaction;
    /// turning it back on commits.
    pub fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        self.snapshot()?;
        match (on, self.conn.is_autocommit()) {
            (false, true) => self.conn.execute_batch("BEGIN IMMEDIATE")?,
            (true, false) => self.conn.execute_batch("COMMIT")?,
            _ => {}
        }
        Ok(())
    }

    pub fn set_read_uncommitted(&mut self, on: bool) -> Result<()> {
        self.snapshot()?;
        self.conn.pragma_update(None, "read_uncommitted", on)?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn commit(&self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Roll back anything still open and put the recorded attributes back.
    pub fn restore(&mut self) -> Result<()> {
        let Some(original) = self.original.take() else {
            return self.rollback();
        };
        if original.auto_commit {
            self.rollback()?;
        } else if !self.in_transaction() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        if self.read_uncommitted()? != original.read_uncommitted {
            self.conn
                .pragma_update(None, "read_uncommitted", original.read_uncommitted)?;
        }
        Ok(())
    }
}

impl Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "failed to restore connection attributes");
        }
    }
}
