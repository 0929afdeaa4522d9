use crate::error::StoreError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Per-connection pragmas; foreign keys are off by default in SQLite
const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub fn create_pool(db_path: &Path) -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
    let pool = Pool::builder().max_size(4).build(manager)?;

    // Database-wide settings persist in the file
    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_every_connection_enforces_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir.path().join("test.sqlite")).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        for conn in [&a, &b] {
            let on: i64 = conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .unwrap();
            assert_eq!(on, 1);
        }
    }
}
