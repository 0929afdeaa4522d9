use crate::error::StoreError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Archive identifier; 0 means "not persisted yet"
pub type ArchiveId = i64;

/// A directory registered for versioned backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub id: ArchiveId,
    pub name: String,
    pub comment: String,
    pub path: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Archive {
    /// Unsaved archive (id 0, no timestamps)
    pub fn new(name: impl Into<String>, path: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            comment: comment.into(),
            path: path.into(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidField("archive name"));
        }
        if self.path.trim().is_empty() {
            return Err(StoreError::InvalidField("archive path"));
        }
        Ok(())
    }
}

fn row_to_archive(row: &Row) -> rusqlite::Result<Archive> {
    Ok(Archive {
        id: row.get("id")?,
        name: row.get("name")?,
        comment: row.get("comment")?,
        path: row.get("path")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> Result<Vec<Archive>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM archives ORDER BY id")?;
    let rows = stmt.query_map([], row_to_archive)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: ArchiveId) -> Result<Option<Archive>, StoreError> {
    Ok(conn
        .query_row("SELECT * FROM archives WHERE id = ?1", params![id], row_to_archive)
        .optional()?)
}

pub fn exists(conn: &Connection, id: ArchiveId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM archives WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Insert `data` (its id is ignored) and return the stored row
pub fn create(conn: &Connection, data: &Archive) -> Result<Archive, StoreError> {
    data.validate()?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO archives (name, comment, path, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![data.name, data.comment, data.path, now, now],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or(StoreError::ArchiveMissing(id))
}

/// Overwrite name, path and comment of an existing archive
pub fn update(conn: &Connection, data: &Archive) -> Result<Archive, StoreError> {
    data.validate()?;
    let now = chrono::Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE archives SET name = ?1, comment = ?2, path = ?3, updated_at = ?4 WHERE id = ?5",
        params![data.name, data.comment, data.path, now, data.id],
    )?;
    if changed == 0 {
        return Err(StoreError::ArchiveMissing(data.id));
    }
    find_by_id(conn, data.id)?.ok_or(StoreError::ArchiveMissing(data.id))
}

/// Delete an archive and its backup records in one transaction
pub fn delete(conn: &mut Connection, id: ArchiveId) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let records = tx.execute("DELETE FROM backup_records WHERE archive_id = ?1", params![id])?;
    let archives = tx.execute("DELETE FROM archives WHERE id = ?1", params![id])?;
    tx.commit()?;

    tracing::debug!(archive_id = id, records, archives, "Deleted archive rows");
    Ok(())
}
