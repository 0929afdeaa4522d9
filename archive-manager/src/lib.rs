//! Archive Manager Library
//!
//! Catalogue of archived directories and their restic backups: SQLite
//! persistence, an in-memory archive cache, periodic tasks and the service
//! that runs backups, restores and forgets one archive at a time.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types
pub use cache::{ArchiveCache, ArchiveStore, CacheError};
pub use config::AppConfig;
pub use error::StoreError;
pub use models::{Archive, ArchiveId, BackupRecord};
pub use services::archives::{ArchiveRun, ArchiveService};
pub use state::AppState;
