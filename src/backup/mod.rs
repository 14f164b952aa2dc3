pub mod manager;
pub mod storage;

pub use manager::{BackupManager, DEFAULT_RETENTION_DAYS, SCHEDULE_INTERVAL_MS};
pub use storage::{ObjectStorage, StorageConfig};
