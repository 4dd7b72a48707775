//! rsync-backup library
//!
//! Scheduled, hard-link deduplicated rsync snapshots of remote hosts, with
//! time-bucketed retention and run reporting to Zabbix.

pub mod config;
pub mod executor;
pub mod notify;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, HostConfig};
pub use executor::{BackupExecutor, RunStatistics};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
