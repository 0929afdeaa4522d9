use rusqlite::ffi;

/// Friendly names for columns carrying a UNIQUE constraint
const UNIQUE_LABELS: &[(&str, &str)] = &[
    ("archives.name", "archive name"),
    ("archives.path", "archive path"),
    ("backup_records.snapshot", "snapshot"),
];

const UNIQUE_PREFIX: &str = "UNIQUE constraint failed:";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{label} already exists, please use another {label}")]
    UniqueViolation { field: String, label: String },

    #[error("{0} must not be empty")]
    InvalidField(&'static str),

    #[error("archive {0} does not exist")]
    ArchiveMissing(i64),

    #[error("backup record {0} does not exist")]
    RecordMissing(i64),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, Some(ref msg)) = e {
            if code.code == ffi::ErrorCode::ConstraintViolation {
                if let Some(field) = unique_field(msg) {
                    return unique_violation(field);
                }
            }
        }
        StoreError::Database(e)
    }
}

/// `"UNIQUE constraint failed: archives.name"` → `"archives.name"`
fn unique_field(message: &str) -> Option<&str> {
    let field = message.split_once(UNIQUE_PREFIX)?.1.trim();
    // Composite constraints list several columns; the first one names the violation
    field.split(',').next().map(str::trim).filter(|f| !f.is_empty())
}

fn unique_violation(field: &str) -> StoreError {
    let label = UNIQUE_LABELS
        .iter()
        .find(|(column, _)| *column == field)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| {
            field
                .rsplit_once('.')
                .map_or(field, |(_, column)| column)
                .to_string()
        });

    StoreError::UniqueViolation {
        field: field.to_string(),
        label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint_error(msg: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some(msg.to_string()),
        )
    }

    #[test]
    fn test_known_unique_field_gets_label() {
        let err = StoreError::from(constraint_error("UNIQUE constraint failed: archives.name"));
        match &err {
            StoreError::UniqueViolation { field, label } => {
                assert_eq!(field, "archives.name");
                assert_eq!(label, "archive name");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "archive name already exists, please use another archive name"
        );
    }

    #[test]
    fn test_unknown_unique_field_uses_column() {
        let err = StoreError::from(constraint_error("UNIQUE constraint failed: things.slug"));
        assert!(matches!(
            err,
            StoreError::UniqueViolation { ref label, .. } if label == "slug"
        ));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let err = StoreError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StoreError::Database(_)));
    }
}
