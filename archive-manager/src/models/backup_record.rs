use crate::error::StoreError;
use crate::models::archive::{self, ArchiveId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// One successful backup of an archive, pointing at its restic snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub archive_id: ArchiveId,
    pub snapshot: String,
    pub comment: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BackupRecord {
    /// First eight characters of the snapshot id, as restic abbreviates it
    pub fn short_snapshot(&self) -> &str {
        self.snapshot.get(..8).unwrap_or(&self.snapshot)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get("id")?,
        archive_id: row.get("archive_id")?,
        snapshot: row.get("snapshot")?,
        comment: row.get("comment")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<BackupRecord>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT * FROM backup_records WHERE id = ?1",
            params![id],
            row_to_record,
        )
        .optional()?)
}

/// Newest first
pub fn find_by_archive_id(
    conn: &Connection,
    archive_id: ArchiveId,
) -> Result<Vec<BackupRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE archive_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![archive_id], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create(
    conn: &Connection,
    archive_id: ArchiveId,
    snapshot: &str,
    comment: &str,
) -> Result<BackupRecord, StoreError> {
    if snapshot.trim().is_empty() {
        return Err(StoreError::InvalidField("snapshot"));
    }
    if !archive::exists(conn, archive_id)? {
        return Err(StoreError::ArchiveMissing(archive_id));
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_records (archive_id, snapshot, comment, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![archive_id, snapshot, comment, now, now],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or(StoreError::RecordMissing(id))
}

pub fn update_comment(conn: &Connection, id: i64, comment: &str) -> Result<BackupRecord, StoreError> {
    let now = chrono::Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE backup_records SET comment = ?1, updated_at = ?2 WHERE id = ?3",
        params![comment, now, id],
    )?;
    if changed == 0 {
        return Err(StoreError::RecordMissing(id));
    }
    find_by_id(conn, id)?.ok_or(StoreError::RecordMissing(id))
}

pub fn delete(conn: &Connection, id: i64) -> Result<(), StoreError> {
    conn.execute("DELETE FROM backup_records WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::models::archive::Archive;

    #[test]
    fn test_create_requires_archive() {
        let (_dir, pool) = testing::pool();
        let conn = pool.get().unwrap();
        assert!(matches!(
            create(&conn, 42, "abc", ""),
            Err(StoreError::ArchiveMissing(42))
        ));
    }

    #[test]
    fn test_snapshot_unique() {
        let (_dir, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let archive = archive::create(&conn, &Archive::new("A", "/a", "")).unwrap();
        create(&conn, archive.id, "deadbeef", "first").unwrap();

        let err = create(&conn, archive.id, "deadbeef", "again").unwrap_err();
        assert!(matches!(
            err,
            StoreError::UniqueViolation { ref label, .. } if label == "snapshot"
        ));
    }

    #[test]
    fn test_cascade_on_archive_row_delete() {
        let (_dir, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let archive = archive::create(&conn, &Archive::new("A", "/a", "")).unwrap();
        let record = create(&conn, archive.id, "deadbeef", "").unwrap();

        // Bypass the transactional helper to exercise the foreign key itself
        conn.execute("DELETE FROM archives WHERE id = ?1", params![archive.id])
            .unwrap();
        assert!(find_by_id(&conn, record.id).unwrap().is_none());
    }

    #[test]
    fn test_list_update_and_delete() {
        let (_dir, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let archive = archive::create(&conn, &Archive::new("A", "/a", "")).unwrap();
        let first = create(&conn, archive.id, "0123456789abcdef", "").unwrap();
        let second = create(&conn, archive.id, "fedcba9876543210", "").unwrap();
        assert_eq!(first.short_snapshot(), "01234567");

        let listed = find_by_archive_id(&conn, archive.id).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|r| r.id == second.id));

        let updated = update_comment(&conn, first.id, "before upgrade").unwrap();
        assert_eq!(updated.comment, "before upgrade");
        assert!(matches!(
            update_comment(&conn, 777, "x"),
            Err(StoreError::RecordMissing(777))
        ));

        delete(&conn, first.id).unwrap();
        assert_eq!(find_by_archive_id(&conn, archive.id).unwrap().len(), 1);
    }
}
