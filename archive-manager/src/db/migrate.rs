use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS archives (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE CHECK(length(name) > 0),
  comment TEXT NOT NULL DEFAULT '',
  path TEXT NOT NULL UNIQUE CHECK(length(path) > 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  archive_id INTEGER NOT NULL REFERENCES archives(id) ON DELETE CASCADE,
  snapshot TEXT NOT NULL UNIQUE CHECK(length(snapshot) BETWEEN 1 AND 64),
  comment TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_records_archive_id ON backup_records(archive_id);
CREATE INDEX IF NOT EXISTS idx_backup_records_created_at ON backup_records(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir.path().join("test.sqlite")).unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('archives', 'backup_records')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
