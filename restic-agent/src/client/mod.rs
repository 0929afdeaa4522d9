//! High-level restic operations.
//!
//! Long-running operations (`backup`, `restore`) return a [`RunHandle`] that streams
//! progress. Short commands run to completion with their output captured into
//! pooled buffers and parsed.

pub mod stats;

pub use stats::{RawDataStats, RestoreSizeStats, SnapshotInfo, SnapshotSummary};

use crate::classify::classify;
use crate::command::{self, Operation, StatsMode};
use crate::config::SharedSettings;
use crate::pool::{Pool, PoolConfig};
use crate::stream::{spawn_run, RunHandle};
use crate::utils::{AgentError, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::process::ExitStatus;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Capture buffers larger than this are dropped instead of pooled
const MAX_POOLED_BUFFER: usize = 1 << 20;

/// Initial capacity of a capture buffer
const BUFFER_CAPACITY: usize = 4096;

/// Marker restic prints when `init` finds an existing repository
const ALREADY_INITIALIZED: &str = "config file already exists";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryStatus {
    /// The repository was already there
    Existing,
    /// `restic init` created it in this process
    Created,
}

/// Output of a finished short command
struct Captured<'a> {
    status: ExitStatus,
    stdout: &'a [u8],
    stderr: &'a [u8],
}

impl Captured<'_> {
    fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(self.stderr);
        if !text.is_empty() && !stderr.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
        text.trim().to_string()
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.stdout)?)
    }
}

pub struct Restic {
    settings: SharedSettings,
    buffers: Pool<Vec<u8>>,
    repository: OnceCell<RepositoryStatus>,
}

impl Restic {
    /// Must be called from within a tokio runtime so the buffer pool can trim itself.
    pub fn new(settings: SharedSettings) -> Result<Self> {
        let buffers = Pool::new(PoolConfig::default(), || Vec::with_capacity(BUFFER_CAPACITY))?;
        Ok(Self {
            settings,
            buffers,
            repository: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Make sure the repository exists, initialising it on first use.
    ///
    /// Runs at most once per client; later calls return the first result.
    pub async fn ensure_repository(&self) -> Result<RepositoryStatus> {
        self.repository
            .get_or_try_init(|| self.open_or_init())
            .await
            .copied()
    }

    async fn open_or_init(&self) -> Result<RepositoryStatus> {
        let settings = self.settings.snapshot();
        let binary = settings.binary();
        if !binary.is_file() {
            return Err(AgentError::BinaryNotFound(binary.display().to_string()));
        }
        tokio::fs::create_dir_all(&settings.repository).await?;
        tokio::fs::create_dir_all(&settings.cache_dir).await?;

        let opened = self
            .run_captured(Operation::CatConfig, |out| Ok(out.status.success()))
            .await?;
        if opened {
            debug!(repository = %settings.repository.display(), "Restic repository found");
            return Ok(RepositoryStatus::Existing);
        }

        self.run_captured(Operation::Init, |out| {
            let text = out.combined();
            if out.status.success() {
                info!(repository = %settings.repository.display(), "Initialised restic repository");
                Ok(RepositoryStatus::Created)
            } else if text.contains(ALREADY_INITIALIZED) {
                Ok(RepositoryStatus::Existing)
            } else {
                Err(AgentError::Repository(format!(
                    "failed to initialise repository: {text}"
                )))
            }
        })
        .await
    }

    /// Back up `path`, streaming progress
    pub async fn backup(&self, path: &Path) -> Result<RunHandle> {
        if path.as_os_str().is_empty() {
            return Err(AgentError::InvalidArgument("backup path is empty".into()));
        }
        self.ensure_repository().await?;

        let cmd = command::build(
            &self.settings,
            &Operation::Backup {
                path: path.to_path_buf(),
            },
        )?;
        info!(path = %path.display(), "Starting backup");
        Ok(spawn_run(cmd))
    }

    /// Restore `snapshot` over `path`, streaming progress
    pub async fn restore(&self, snapshot: &str, path: &Path) -> Result<RunHandle> {
        self.ensure_repository().await?;

        let cmd = command::build(
            &self.settings,
            &Operation::Restore {
                snapshot: snapshot.to_string(),
                path: path.to_path_buf(),
            },
        )?;
        info!(snapshot, path = %path.display(), "Starting restore");
        Ok(spawn_run(cmd))
    }

    /// Forget and prune the given snapshots
    pub async fn forget(&self, snapshots: &[String]) -> Result<()> {
        let op = Operation::Forget {
            snapshots: snapshots.to_vec(),
        };
        self.run_captured(op, |out| {
            if out.status.success() {
                Ok(())
            } else {
                Err(classify(&out.combined()).into())
            }
        })
        .await?;
        info!(count = snapshots.len(), "Forgot snapshots");
        Ok(())
    }

    /// Space `snapshot` occupies in the repository
    pub async fn raw_data_stats(&self, snapshot: &str) -> Result<RawDataStats> {
        self.stats(snapshot, StatsMode::RawData).await
    }

    /// Size a restore of `snapshot` would write
    pub async fn restore_size_stats(&self, snapshot: &str) -> Result<RestoreSizeStats> {
        self.stats(snapshot, StatsMode::RestoreSize).await
    }

    async fn stats<T: DeserializeOwned>(&self, snapshot: &str, mode: StatsMode) -> Result<T> {
        let op = Operation::Stats {
            snapshot: snapshot.to_string(),
            mode,
        };
        self.run_captured(op, |out| {
            if !out.status.success() {
                return Err(AgentError::Repository(format!(
                    "stats for {snapshot} failed: {}",
                    out.combined()
                )));
            }
            out.parse()
        })
        .await
    }

    /// Metadata of a single snapshot
    pub async fn snapshot_info(&self, snapshot: &str) -> Result<SnapshotInfo> {
        if snapshot.is_empty() {
            return Err(AgentError::InvalidArgument("snapshot id is empty".into()));
        }
        let op = Operation::Snapshots {
            snapshot: snapshot.to_string(),
        };
        self.run_captured(op, |out| {
            if !out.status.success() {
                return Err(AgentError::Repository(format!(
                    "listing snapshot {snapshot} failed: {}",
                    out.combined()
                )));
            }
            let mut found: Vec<SnapshotInfo> = out.parse()?;
            if found.is_empty() {
                return Err(AgentError::Repository(format!(
                    "snapshot {snapshot} not found"
                )));
            }
            Ok(found.swap_remove(0))
        })
        .await
    }

    /// Capture buffers currently held for reuse
    pub fn pooled_buffers(&self) -> usize {
        self.buffers.size()
    }

    /// Run a short command to completion and hand its output to `parse`
    async fn run_captured<R>(
        &self,
        op: Operation,
        parse: impl FnOnce(&Captured<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut cmd = command::build(&self.settings, &op)?;
        let mut child = cmd.spawn().map_err(|e| {
            warn!(op = op.name(), error = %e, "Failed to launch restic");
            AgentError::Io(e)
        })?;

        let mut stdout = self.buffers.acquire();
        let mut stderr = self.buffers.acquire();
        stdout.clear();
        stderr.clear();

        let result = match collect(&mut child, &mut stdout, &mut stderr).await {
            Ok(status) => {
                debug!(op = op.name(), %status, "Restic command finished");
                parse(&Captured {
                    status,
                    stdout: &stdout,
                    stderr: &stderr,
                })
            }
            Err(e) => Err(e),
        };

        self.recycle(stdout);
        self.recycle(stderr);
        result
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() <= MAX_POOLED_BUFFER {
            buf.clear();
            self.buffers.release(buf);
        }
    }
}

async fn collect(child: &mut Child, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> Result<ExitStatus> {
    let mut out_pipe = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Config("restic stdout is not piped".into()))?;
    let mut err_pipe = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::Config("restic stderr is not piped".into()))?;

    tokio::try_join!(out_pipe.read_to_end(stdout), err_pipe.read_to_end(stderr))?;
    Ok(child.wait().await?)
}
