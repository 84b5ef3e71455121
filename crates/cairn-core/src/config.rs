use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CairnError, Result};

pub const DEFAULT_SCHEDULER_NAME: &str = "CairnScheduler";
pub const DEFAULT_INSTANCE_ID: &str = "NON_CLUSTERED";
/// Instance id placeholder that is replaced by a freshly minted id at start-up.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_TABLE_PREFIX: &str = "CAIRN_";
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_CLUSTER_CHECKIN_INTERVAL_MS: u64 = 7_500;
/// Extra slack granted to a peer before it is declared failed.
pub const DEFAULT_CLUSTER_FAILURE_GRACE_MS: u64 = 7_500;
pub const DEFAULT_MAX_MISFIRES_PER_PASS: usize = 20;
pub const DEFAULT_DB_RETRY_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 3;
pub const DEFAULT_LOCK_RETRY_PERIOD_MS: u64 = 1_000;
pub const DEFAULT_ACQUIRE_RETRY_COUNT: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (cairn.toml + CAIRN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CairnConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub job_store: JobStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Which lock manager guards `TRIGGER_ACCESS` / `STATE_ACCESS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LockHandlerKind {
    /// Mutex + condition variable inside this process only.
    InProcess,
    /// A row in the `LOCKS` table, shared by every instance of the cluster.
    Row,
    /// In-process lock whose release waits for an ambient transaction to end.
    TransactionBound,
}

/// Settings consumed by the job store at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    /// Unique per cluster member. `AUTO` mints one at start-up.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default)]
    pub clustered: bool,
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    #[serde(default = "default_cluster_checkin_interval_ms")]
    pub cluster_checkin_interval_ms: u64,
    #[serde(default = "default_cluster_failure_grace_ms")]
    pub cluster_failure_grace_ms: u64,
    #[serde(default = "default_max_misfires_per_pass")]
    pub max_misfires_to_handle_at_a_time: usize,
    #[serde(default = "default_db_retry_interval_ms")]
    pub db_retry_interval_ms: u64,
    /// Unset means `row` when clustered and `in-process` otherwise.
    #[serde(default)]
    pub lock_handler: Option<LockHandlerKind>,
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,
    #[serde(default = "default_lock_retry_period_ms")]
    pub lock_retry_period_ms: u64,
    /// Take `TRIGGER_ACCESS` even when acquiring a single trigger.
    #[serde(default)]
    pub acquire_triggers_within_lock: bool,
    /// Total passes over the acquisition query while passes keep selecting
    /// nothing (at least one).
    #[serde(default = "default_acquire_retry_count")]
    pub acquire_retry_count: u32,
    /// Count misfires without a lock before taking `TRIGGER_ACCESS`.
    #[serde(default = "bool_true")]
    pub double_check_lock_misfire_handler: bool,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            scheduler_name: default_scheduler_name(),
            instance_id: default_instance_id(),
            table_prefix: default_table_prefix(),
            clustered: false,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            cluster_checkin_interval_ms: DEFAULT_CLUSTER_CHECKIN_INTERVAL_MS,
            cluster_failure_grace_ms: DEFAULT_CLUSTER_FAILURE_GRACE_MS,
            max_misfires_to_handle_at_a_time: DEFAULT_MAX_MISFIRES_PER_PASS,
            db_retry_interval_ms: DEFAULT_DB_RETRY_INTERVAL_MS,
            lock_handler: None,
            lock_retry_count: DEFAULT_LOCK_RETRY_COUNT,
            lock_retry_period_ms: DEFAULT_LOCK_RETRY_PERIOD_MS,
            acquire_triggers_within_lock: false,
            acquire_retry_count: DEFAULT_ACQUIRE_RETRY_COUNT,
            double_check_lock_misfire_handler: true,
        }
    }
}

impl JobStoreConfig {
    /// The instance id with `AUTO` expanded.
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id == AUTO_INSTANCE_ID {
            Uuid::now_v7().to_string()
        } else {
            self.instance_id.clone()
        }
    }

    pub fn lock_handler_kind(&self) -> LockHandlerKind {
        self.lock_handler.unwrap_or(if self.clustered {
            LockHandlerKind::Row
        } else {
            LockHandlerKind::InProcess
        })
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_checkin_interval_ms)
    }

    pub fn cluster_failure_grace(&self) -> Duration {
        Duration::from_millis(self.cluster_failure_grace_ms)
    }

    pub fn db_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_retry_interval_ms)
    }

    pub fn lock_retry_period(&self) -> Duration {
        Duration::from_millis(self.lock_retry_period_ms)
    }

    /// Reject combinations the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_name.trim().is_empty() {
            return Err(invalid("scheduler_name", "must not be empty"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(invalid("instance_id", "must not be empty"));
        }
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid(
                "table_prefix",
                "only ASCII letters, digits and '_' are allowed",
            ));
        }
        if self.clustered && self.lock_handler_kind() != LockHandlerKind::Row {
            return Err(invalid(
                "lock_handler",
                "clustered mode requires the row lock handler",
            ));
        }
        if self.cluster_checkin_interval_ms == 0 {
            return Err(invalid("cluster_checkin_interval_ms", "must be positive"));
        }
        if self.db_retry_interval_ms == 0 {
            return Err(invalid("db_retry_interval_ms", "must be positive"));
        }
        if self.max_misfires_to_handle_at_a_time == 0 {
            return Err(invalid("max_misfires_to_handle_at_a_time", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> CairnError {
    CairnError::InvalidSetting {
        key,
        reason: reason.to_string(),
    }
}

fn bool_true() -> bool {
    true
}
fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_string()
}
fn default_instance_id() -> String {
    DEFAULT_INSTANCE_ID.to_string()
}
fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_cluster_checkin_interval_ms() -> u64 {
    DEFAULT_CLUSTER_CHECKIN_INTERVAL_MS
}
fn default_cluster_failure_grace_ms() -> u64 {
    DEFAULT_CLUSTER_FAILURE_GRACE_MS
}
fn default_max_misfires_per_pass() -> usize {
    DEFAULT_MAX_MISFIRES_PER_PASS
}
fn default_db_retry_interval_ms() -> u64 {
    DEFAULT_DB_RETRY_INTERVAL_MS
}
fn default_lock_retry_count() -> u32 {
    DEFAULT_LOCK_RETRY_COUNT
}
fn default_lock_retry_period_ms() -> u64 {
    DEFAULT_LOCK_RETRY_PERIOD_MS
}
fn default_acquire_retry_count() -> u32 {
    DEFAULT_ACQUIRE_RETRY_COUNT
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cairn/cairn.db", home)
}

impl CairnConfig {
    /// Load config from a TOML file with CAIRN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CAIRN_JOB_STORE__CLUSTERED=true`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        let config: CairnConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CAIRN_").split("__"))
            .extract()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        config.job_store.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cairn/cairn.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = JobStoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.lock_handler_kind(), LockHandlerKind::InProcess);
        assert_eq!(cfg.misfire_threshold(), Duration::from_secs(60));
        assert_eq!(cfg.cluster_failure_grace(), Duration::from_millis(7_500));
    }

    #[test]
    fn clustered_defaults_to_row_lock() {
        let cfg = JobStoreConfig {
            clustered: true,
            ..Default::default()
        };
        assert_eq!(cfg.lock_handler_kind(), LockHandlerKind::Row);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn clustered_rejects_in_process_lock() {
        let cfg = JobStoreConfig {
            clustered: true,
            lock_handler: Some(LockHandlerKind::InProcess),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_SETTING");
    }

    #[test]
    fn bad_table_prefix_rejected() {
        let cfg = JobStoreConfig {
            table_prefix: "X; DROP".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auto_instance_id_is_expanded() {
        let cfg = JobStoreConfig {
            instance_id: AUTO_INSTANCE_ID.to_string(),
            ..Default::default()
        };
        let a = cfg.resolved_instance_id();
        let b = cfg.resolved_instance_id();
        assert_ne!(a, AUTO_INSTANCE_ID);
        assert_ne!(a, b);
    }

    #[test]
    fn load_reads_toml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/cairn-test.db"

[job_store]
scheduler_name = "Payroll"
instance_id = "node-1"
clustered = true
misfire_threshold_ms = 5000
"#
        )
        .unwrap();

        let cfg = CairnConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/cairn-test.db");
        assert_eq!(cfg.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert_eq!(cfg.job_store.scheduler_name, "Payroll");
        assert_eq!(cfg.job_store.instance_id, "node-1");
        assert!(cfg.job_store.clustered);
        assert_eq!(cfg.job_store.misfire_threshold_ms, 5000);
        assert_eq!(cfg.job_store.table_prefix, DEFAULT_TABLE_PREFIX);
    }

    #[test]
    fn load_rejects_invalid_combination() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[job_store]\nclustered = true\nlock_handler = \"in-process\"\n"
        )
        .unwrap();
        assert!(CairnConfig::load(file.path().to_str()).is_err());
    }
}
