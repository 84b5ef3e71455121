use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors raised by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A named lock could not be obtained after exhausting retries.
    #[error("Failed to obtain lock {name}: {reason}")]
    Lock { name: String, reason: String },

    /// Storage-level failure carrying context about what was attempted.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Insert collision when replacing was not requested.
    #[error("Unable to store {kind} '{key}': it already exists")]
    ObjectAlreadyExists { kind: &'static str, key: String },

    #[error("Job not found: {key}")]
    JobNotFound { key: String },

    #[error("Trigger not found: {key}")]
    TriggerNotFound { key: String },

    #[error("Calendar not found: {name}")]
    CalendarNotFound { name: String },

    /// A job data map, calendar or schedule payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store is shutting down; retrying callers give up with this.
    #[error("Job store is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobStoreError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            JobStoreError::Database(_) => "DATABASE_ERROR",
            JobStoreError::Lock { .. } => "LOCK_FAILURE",
            JobStoreError::Persistence(_) => "PERSISTENCE_FAILURE",
            JobStoreError::ObjectAlreadyExists { .. } => "OBJECT_ALREADY_EXISTS",
            JobStoreError::JobNotFound { .. } => "JOB_NOT_FOUND",
            JobStoreError::TriggerNotFound { .. } => "TRIGGER_NOT_FOUND",
            JobStoreError::CalendarNotFound { .. } => "CALENDAR_NOT_FOUND",
            JobStoreError::Serialization(_) => "SERIALIZATION_ERROR",
            JobStoreError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            JobStoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            JobStoreError::ShuttingDown => "SHUTTING_DOWN",
            JobStoreError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// SQLite reported contention (`SQLITE_BUSY` / `SQLITE_LOCKED`).
    pub fn is_transient(&self) -> bool {
        match self {
            JobStoreError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

impl From<cairn_core::CairnError> for JobStoreError {
    fn from(e: cairn_core::CairnError) -> Self {
        JobStoreError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobStoreError>;
