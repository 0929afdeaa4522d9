//! Shapes of `restic stats --json` and `restic snapshots --json` output.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// `stats --mode raw-data`: space the snapshot actually occupies in the repository
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDataStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_uncompressed_size: u64,
    #[serde(default)]
    pub compression_ratio: f64,
    #[serde(default)]
    pub compression_progress: f64,
    #[serde(default)]
    pub compression_space_saving: f64,
    #[serde(default)]
    pub total_blob_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

/// `stats --mode restore-size`: size of the files a restore would write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSizeStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

/// Backup summary restic stores inside each snapshot (restic 0.17+)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub backup_start: Option<DateTime<FixedOffset>>,
    pub backup_end: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub dirs_new: u64,
    #[serde(default)]
    pub dirs_changed: u64,
    #[serde(default)]
    pub dirs_unmodified: u64,
    #[serde(default)]
    pub data_blobs: i64,
    #[serde(default)]
    pub tree_blobs: i64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub data_added_packed: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
}

/// One entry of `restic snapshots --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<FixedOffset>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub program_version: Option<String>,
    #[serde(default)]
    pub summary: Option<SnapshotSummary>,
}
