//! `cairn-core`: configuration and shared error types for the Cairn job store.

pub mod config;
pub mod error;

pub use config::{CairnConfig, DatabaseConfig, JobStoreConfig, LockHandlerKind};
pub use error::{CairnError, Result};
