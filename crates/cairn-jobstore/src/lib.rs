//! `cairn-jobstore`: persistent, cluster-aware job store for a scheduler.
//!
//! # Overview
//!
//! Jobs, triggers, calendars and in-flight fires live in SQLite tables
//! keyed by scheduler name. A [`JobStore`] hands triggers to the scheduler
//! through three calls:
//!
//! 1. [`JobStore::acquire_next_triggers`] claims due triggers (WAITING → ACQUIRED).
//! 2. [`JobStore::triggers_fired`] turns them into fires and advances schedules.
//! 3. [`JobStore::triggered_job_complete`] records the outcome.
//!
//! Two background threads keep the store healthy: the misfire handler
//! re-schedules triggers that went overdue, and (when clustered) the cluster
//! manager heartbeats and recovers the work of dead instances.
//!
//! # Locks
//!
//! | Handler                      | Scope        | Released at          |
//! |------------------------------|--------------|----------------------|
//! | [`SimpleSemaphore`]          | process      | end of unit of work  |
//! | [`RowLockSemaphore`]         | database     | end of unit of work  |
//! | [`TransactionBoundSemaphore`]| process      | ambient tx completion|

pub mod ambient;
pub mod calendar;
pub mod connection;
pub mod db;
pub mod delegate;
pub mod error;
pub mod lock;
pub mod schedule;
pub mod shutdown;
pub mod signaler;
pub mod store;
pub mod types;

pub use ambient::{AmbientTransaction, CompletionCallback, LocalTransaction};
pub use calendar::Calendar;
pub use connection::{ConnectionGuard, ConnectionProvider, SqliteConnectionProvider};
pub use db::init_db;
pub use delegate::{ScheduleCodec, ScheduleRegistry, SqliteDelegate, StoreDelegate};
pub use error::{JobStoreError, Result};
pub use lock::{
    LockHandler, LockName, LockOwner, RowLockSemaphore, SimpleSemaphore,
    TransactionBoundSemaphore,
};
pub use shutdown::Shutdown;
pub use signaler::{ChannelSignaler, Signaler, StoreEvent};
pub use store::{JobStore, JobStoreBuilder, ManagedJobStore, RecoverMisfiredResult};
pub use types::*;
