#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::JobStoreConfig;
use cairn_jobstore::{
    ChannelSignaler, JobDetail, JobStore, Key, Schedule, SqliteConnectionProvider, StoreEvent,
    Trigger,
};
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct TestDb {
    pub dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("jobs.db")
    }

    pub fn provider(&self) -> Arc<SqliteConnectionProvider> {
        Arc::new(SqliteConnectionProvider::new(
            self.path(),
            Duration::from_secs(5),
        ))
    }

    /// Connections that fail at once instead of waiting for a busy database.
    pub fn impatient_provider(&self) -> Arc<SqliteConnectionProvider> {
        Arc::new(SqliteConnectionProvider::new(self.path(), Duration::ZERO))
    }

    pub fn open(&self, config: JobStoreConfig) -> (Arc<JobStore>, mpsc::Receiver<StoreEvent>) {
        self.open_with(config, self.provider())
    }

    pub fn open_with(
        &self,
        config: JobStoreConfig,
        provider: Arc<SqliteConnectionProvider>,
    ) -> (Arc<JobStore>, mpsc::Receiver<StoreEvent>) {
        let (signaler, events) = ChannelSignaler::channel(256);
        let store = JobStore::builder(config)
            .connection_provider(provider)
            .signaler(Arc::new(signaler))
            .build()
            .unwrap();
        (store, events)
    }
}

pub fn config(instance_id: &str) -> JobStoreConfig {
    JobStoreConfig {
        scheduler_name: "test".into(),
        instance_id: instance_id.into(),
        db_retry_interval_ms: 50,
        ..Default::default()
    }
}

pub fn clustered_config(instance_id: &str) -> JobStoreConfig {
    JobStoreConfig {
        clustered: true,
        cluster_checkin_interval_ms: 100,
        cluster_failure_grace_ms: 0,
        lock_retry_period_ms: 20,
        ..config(instance_id)
    }
}

pub fn job(name: &str) -> JobDetail {
    JobDetail::new(Key::named(name), "noop").with_durability(true)
}

pub fn once(name: &str, job: &JobDetail, at: DateTime<Utc>) -> Trigger {
    Trigger::new(Key::named(name), job.key.clone(), Schedule::once(), at)
}

pub fn drain(events: &mut mpsc::Receiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
