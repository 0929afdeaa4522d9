//! SQLite-backed archive store.

use crate::cache::ArchiveStore;
use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::error::StoreError;
use crate::models::{archive, backup_record, Archive, ArchiveId, BackupRecord};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) and migrate the database at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = create_pool(path)?;
        migrate(&pool)?;
        Ok(Self::new(pool))
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    pub fn create_record(
        &self,
        archive_id: ArchiveId,
        snapshot: &str,
        comment: &str,
    ) -> Result<BackupRecord, StoreError> {
        let conn = self.conn()?;
        backup_record::create(&conn, archive_id, snapshot, comment)
    }

    pub fn update_record(&self, id: i64, comment: &str) -> Result<BackupRecord, StoreError> {
        let conn = self.conn()?;
        backup_record::update_comment(&conn, id, comment)
    }

    pub fn delete_record(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        backup_record::delete(&conn, id)
    }

    pub fn find_record(&self, id: i64) -> Result<Option<BackupRecord>, StoreError> {
        let conn = self.conn()?;
        backup_record::find_by_id(&conn, id)
    }

    pub fn records_for(&self, archive_id: ArchiveId) -> Result<Vec<BackupRecord>, StoreError> {
        let conn = self.conn()?;
        backup_record::find_by_archive_id(&conn, archive_id)
    }
}

impl ArchiveStore for SqliteStore {
    fn find_all(&self) -> Result<Vec<Archive>, StoreError> {
        let conn = self.conn()?;
        archive::find_all(&conn)
    }

    fn find_by_id(&self, id: ArchiveId) -> Result<Option<Archive>, StoreError> {
        let conn = self.conn()?;
        archive::find_by_id(&conn, id)
    }

    fn create(&self, data: &Archive) -> Result<Archive, StoreError> {
        let conn = self.conn()?;
        archive::create(&conn, data)
    }

    fn update(&self, data: &Archive) -> Result<Archive, StoreError> {
        let conn = self.conn()?;
        archive::update(&conn, data)
    }

    fn delete(&self, id: ArchiveId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        archive::delete(&mut conn, id)
    }
}
