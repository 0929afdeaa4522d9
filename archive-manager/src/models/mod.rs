pub mod archive;
pub mod backup_record;

pub use archive::{Archive, ArchiveId};
pub use backup_record::BackupRecord;
