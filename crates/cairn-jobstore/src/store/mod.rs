//! The persistent job store: storage API, trigger firing, and the misfire
//! and cluster monitors.

mod acquire;
mod cluster;
mod managed;
mod misfire;
mod ops;
mod recovery;
mod tx;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use cairn_core::{CairnConfig, JobStoreConfig, LockHandlerKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::calendar::Calendar;
use crate::connection::{ConnectionProvider, SqliteConnectionProvider};
use crate::db::init_db;
use crate::delegate::{ScheduleRegistry, SqliteDelegate, StoreDelegate};
use crate::error::{JobStoreError, Result};
use crate::lock::{LockHandler, RowLockSemaphore, SimpleSemaphore, TransactionBoundSemaphore};
use crate::shutdown::Shutdown;
use crate::signaler::{NullSignaler, Signaler};
use crate::types::{to_millis, SchedulerStateRecord};

pub use managed::ManagedJobStore;
pub use misfire::RecoverMisfiredResult;
pub(crate) use tx::TxContext;

/// Cluster-aware job store over a relational database.
///
/// Shared as `Arc<JobStore>`; every operation is synchronous and runs in its
/// own transaction unless called through [`ManagedJobStore`].
pub struct JobStore {
    config: JobStoreConfig,
    instance_id: String,
    delegate: Arc<dyn StoreDelegate>,
    provider: Arc<dyn ConnectionProvider>,
    locks: Arc<dyn LockHandler>,
    signaler: Arc<dyn Signaler>,
    shutdown: Shutdown,
    /// Only consulted when not clustered; peers may change calendars otherwise.
    calendar_cache: DashMap<String, Calendar>,
    first_checkin: AtomicBool,
    /// Epoch millis of this instance's last successful check-in.
    last_checkin: AtomicI64,
    scheduling_paused: AtomicBool,
    scheduler_running: AtomicBool,
    recover_counter: AtomicI64,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

pub struct JobStoreBuilder {
    config: JobStoreConfig,
    provider: Option<Arc<dyn ConnectionProvider>>,
    signaler: Option<Arc<dyn Signaler>>,
    locks: Option<Arc<dyn LockHandler>>,
    delegate: Option<Arc<dyn StoreDelegate>>,
    registry: Option<ScheduleRegistry>,
}

impl JobStoreBuilder {
    pub fn connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn signaler(mut self, signaler: Arc<dyn Signaler>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    /// Override the lock handler picked from the configuration.
    pub fn lock_handler(mut self, locks: Arc<dyn LockHandler>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn StoreDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Schedule codecs for the default SQLite delegate.
    pub fn schedule_registry(mut self, registry: ScheduleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration, create the schema and assemble the store.
    pub fn build(self) -> Result<Arc<JobStore>> {
        let config = self.config;
        config.validate()?;
        let provider = self
            .provider
            .ok_or_else(|| JobStoreError::Config("a connection provider is required".into()))?;
        let instance_id = config.resolved_instance_id();

        let locks: Arc<dyn LockHandler> = match (self.locks, config.lock_handler_kind()) {
            (Some(locks), _) => locks,
            (None, LockHandlerKind::InProcess) => Arc::new(SimpleSemaphore::new()),
            (None, LockHandlerKind::Row) => Arc::new(RowLockSemaphore::new(
                config.scheduler_name.clone(),
                config.table_prefix.clone(),
            )),
            (None, LockHandlerKind::TransactionBound) => Arc::new(TransactionBoundSemaphore::new()),
        };
        let delegate: Arc<dyn StoreDelegate> = match self.delegate {
            Some(delegate) => delegate,
            None => Arc::new(SqliteDelegate::new(
                config.scheduler_name.clone(),
                config.table_prefix.clone(),
                Arc::new(self.registry.unwrap_or_default()),
            )),
        };
        let signaler: Arc<dyn Signaler> = match self.signaler {
            Some(signaler) => signaler,
            None => Arc::new(NullSignaler),
        };

        {
            let conn = provider.connection()?;
            init_db(&conn, &config.table_prefix)?;
        }

        info!(
            scheduler = %config.scheduler_name,
            instance_id = %instance_id,
            clustered = config.clustered,
            lock_handler = ?config.lock_handler_kind(),
            "job store initialised"
        );

        let now = to_millis(Utc::now());
        Ok(Arc::new(JobStore {
            instance_id,
            delegate,
            provider,
            locks,
            signaler,
            shutdown: Shutdown::new(),
            calendar_cache: DashMap::new(),
            first_checkin: AtomicBool::new(true),
            last_checkin: AtomicI64::new(now),
            scheduling_paused: AtomicBool::new(false),
            scheduler_running: AtomicBool::new(false),
            recover_counter: AtomicI64::new(now),
            monitors: Mutex::new(Vec::new()),
            config,
        }))
    }
}

impl JobStore {
    pub fn builder(config: JobStoreConfig) -> JobStoreBuilder {
        JobStoreBuilder {
            config,
            provider: None,
            signaler: None,
            locks: None,
            delegate: None,
            registry: None,
        }
    }

    /// Store over the SQLite file named in `config`.
    pub fn open(config: &CairnConfig, signaler: Arc<dyn Signaler>) -> Result<Arc<Self>> {
        let provider = SqliteConnectionProvider::new(
            config.database.path.clone(),
            config.database.busy_timeout(),
        );
        Self::builder(config.job_store.clone())
            .connection_provider(Arc::new(provider))
            .signaler(signaler)
            .build()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn scheduler_name(&self) -> &str {
        &self.config.scheduler_name
    }

    pub fn is_clustered(&self) -> bool {
        self.config.clustered
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    // --- lifecycle ---------------------------------------------------------

    /// Recover leftovers and start the monitor threads.
    ///
    /// Clustered: first check-in (recovering failed peers) then the cluster
    /// thread. Otherwise: full local recovery. Both then start the misfire
    /// thread.
    pub fn scheduler_started(self: &Arc<Self>) -> Result<()> {
        if self.config.clustered {
            match self.check_in() {
                Ok(true) => self.signaler.notify_scheduling_change(None),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "initial cluster check-in failed"),
            }
            let handle = self.spawn_cluster_manager()?;
            self.monitors().push(handle);
        } else {
            self.recover_jobs()?;
        }
        let handle = self.spawn_misfire_handler()?;
        self.monitors().push(handle);
        self.scheduler_running.store(true, Ordering::SeqCst);
        info!(instance_id = %self.instance_id, "job store started");
        Ok(())
    }

    pub fn scheduler_paused(&self) {
        self.scheduling_paused.store(true, Ordering::SeqCst);
        self.scheduler_running.store(false, Ordering::SeqCst);
    }

    pub fn scheduler_resumed(&self) {
        self.scheduling_paused.store(false, Ordering::SeqCst);
        self.scheduler_running.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stop and join the monitors. A clustered instance also removes its
    /// state record so peers do not try to recover it.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.scheduler_running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.monitors().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("monitor").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "monitor thread panicked");
            }
        }
        if self.config.clustered {
            let result = self.execute_in_non_managed_tx_lock(
                None,
                |ctx| self.delegate.delete_scheduler_state(ctx.conn(), &self.instance_id),
                None,
            );
            if let Err(e) = result {
                warn!(error = %e, "failed to remove scheduler state on shutdown");
            }
        }
        info!(instance_id = %self.instance_id, "job store shut down");
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_monitor<F>(&self, role: &str, body: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}_{role}", self.config.scheduler_name);
        thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| JobStoreError::Persistence(format!("failed to spawn {name}: {e}")))
    }

    /// Cluster membership as recorded in the database.
    pub fn get_scheduler_states(&self) -> Result<Vec<SchedulerStateRecord>> {
        self.read(|conn| self.delegate.select_scheduler_state_records(conn, None))
    }

    // --- helpers -----------------------------------------------------------

    /// Run statements on an auto-commit connection, outside any lock. Each
    /// write commits on its own.
    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.provider.connection()?;
        f(&conn)
    }

    fn misfire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::milliseconds(self.config.misfire_threshold_ms as i64)
    }

    fn is_paused(&self) -> bool {
        self.scheduling_paused.load(Ordering::SeqCst)
    }
}
