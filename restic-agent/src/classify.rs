//! Maps raw restic failure output to a user-facing cause.

use thiserror::Error;

/// Why a restic run failed, as far as its output tells us.
///
/// Every variant keeps the raw output for diagnosis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResticError {
    #[error("Permission denied while reading the archive, run the program with administrator rights")]
    PermissionDenied { raw: String },

    #[error("The archive directory does not exist, check its path")]
    PathNotFound { raw: String },

    #[error("Backup failed: {raw}")]
    Unclassified { raw: String },
}

impl ResticError {
    /// The untouched subprocess output this error was built from
    pub fn raw_output(&self) -> &str {
        match self {
            ResticError::PermissionDenied { raw }
            | ResticError::PathNotFound { raw }
            | ResticError::Unclassified { raw } => raw,
        }
    }
}

/// Classify terminated-process output. Checks run in priority order.
pub fn classify(raw_output: &str) -> ResticError {
    let raw = raw_output.to_string();

    if raw_output.contains("Access is denied")
        || raw_output.to_lowercase().contains("permission denied")
    {
        return ResticError::PermissionDenied { raw };
    }

    if raw_output.contains("does not exist, skipping")
        && raw_output.contains("all source directories/files do not exist")
    {
        return ResticError::PathNotFound { raw };
    }

    ResticError::Unclassified { raw }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied() {
        let out = "error: open C:\\saves\\level.dat: Access is denied.";
        let err = classify(out);
        assert!(matches!(err, ResticError::PermissionDenied { .. }));
        assert_eq!(err.raw_output(), out);
    }

    #[test]
    fn test_unix_permission_denied() {
        let err = classify("open /root/world: Permission denied");
        assert!(matches!(err, ResticError::PermissionDenied { .. }));
    }

    #[test]
    fn test_missing_path_needs_both_markers() {
        let out = "/saves/world does not exist, skipping\nFatal: all source directories/files do not exist";
        assert!(matches!(classify(out), ResticError::PathNotFound { .. }));

        let partial = "/saves/world does not exist, skipping";
        assert!(matches!(classify(partial), ResticError::Unclassified { .. }));
    }

    #[test]
    fn test_permission_takes_priority() {
        let out = "Access is denied\nx does not exist, skipping\nall source directories/files do not exist";
        assert!(matches!(classify(out), ResticError::PermissionDenied { .. }));
    }

    #[test]
    fn test_unclassified_keeps_text() {
        let out = "Fatal: wrong password or no key found";
        let err = classify(out);
        assert_eq!(
            err,
            ResticError::Unclassified {
                raw: out.to_string()
            }
        );
        assert_eq!(err.to_string(), format!("Backup failed: {out}"));
    }
}
