//! Archive operations: catalogue changes and restic runs, kept consistent with
//! the store and the cache.
//!
//! The store is written first; the cache is updated afterwards on a best-effort
//! basis because it is only a mirror.

use crate::cache::{ArchiveCache, ArchiveStore, CacheError};
use crate::db::store::SqliteStore;
use crate::error::StoreError;
use crate::models::{Archive, ArchiveId, BackupRecord};
use crate::services::run_registry::{RunGuard, RunKind, RunRegistry};
use restic_agent::client::{RawDataStats, RestoreSizeStats};
use restic_agent::stream::OutcomeTracker;
use restic_agent::{BackupMessage, Restic, RunHandle, RunOutcome};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Repository usage of one backup
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub raw: RawDataStats,
    pub restore: RestoreSizeStats,
}

/// A restic run bound to an archive; holds the archive's run slot until dropped
pub struct ArchiveRun {
    archive: Arc<Archive>,
    kind: RunKind,
    handle: RunHandle,
    tracker: OutcomeTracker,
    _guard: RunGuard,
}

impl ArchiveRun {
    fn new(archive: Arc<Archive>, kind: RunKind, handle: RunHandle, guard: RunGuard) -> Self {
        guard.set_cancel(handle.cancel_token());
        Self {
            archive,
            kind,
            handle,
            tracker: OutcomeTracker::new(),
            _guard: guard,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// Next progress event, `None` once the run is over
    pub async fn recv(&mut self) -> Option<BackupMessage> {
        let msg = self.handle.recv().await?;
        self.tracker.observe(&msg);
        Some(msg)
    }

    /// Consume the remaining events and report how the run ended
    pub async fn finish(mut self) -> RunOutcome {
        self.drain().await
    }

    async fn drain(&mut self) -> RunOutcome {
        while self.recv().await.is_some() {}
        std::mem::take(&mut self.tracker).finish()
    }
}

pub struct ArchiveService {
    store: SqliteStore,
    cache: Arc<ArchiveCache<SqliteStore>>,
    restic: Arc<Restic>,
    runs: Arc<RunRegistry>,
}

impl ArchiveService {
    pub fn new(
        store: SqliteStore,
        cache: Arc<ArchiveCache<SqliteStore>>,
        restic: Arc<Restic>,
        runs: Arc<RunRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            restic,
            runs,
        }
    }

    pub fn cache(&self) -> &Arc<ArchiveCache<SqliteStore>> {
        &self.cache
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    pub fn restic(&self) -> &Arc<Restic> {
        &self.restic
    }

    pub async fn refresh_cache(&self) -> anyhow::Result<usize> {
        let cache = Arc::clone(&self.cache);
        blocking(move || Ok(cache.refresh()?)).await
    }

    /// Cached archives ordered by id
    pub fn list_archives(&self) -> Vec<Arc<Archive>> {
        let mut archives: Vec<_> = self.cache.get_all().into_values().collect();
        archives.sort_by_key(|a| a.id);
        archives
    }

    /// Archive by id, loading it from the store on a cache miss
    pub async fn archive(&self, id: ArchiveId) -> anyhow::Result<Arc<Archive>> {
        if id == 0 {
            return Err(CacheError::InvalidKey.into());
        }
        let cache = Arc::clone(&self.cache);
        blocking(move || {
            cache.get_or_create(id, || {
                cache
                    .store()
                    .find_by_id(id)?
                    .ok_or_else(|| anyhow::Error::from(StoreError::ArchiveMissing(id)))
            })
        })
        .await
    }

    pub async fn create_archive(
        &self,
        name: &str,
        path: &Path,
        comment: &str,
    ) -> anyhow::Result<Arc<Archive>> {
        if !path.is_dir() {
            anyhow::bail!("archive path {} is not a directory", path.display());
        }

        let data = Archive::new(name.trim(), path.to_string_lossy(), comment);
        let cache = Arc::clone(&self.cache);
        let created = blocking(move || {
            cache.get_or_create(0, || cache.store().create(&data).map_err(anyhow::Error::from))
        })
        .await?;

        info!(archive_id = created.id, name = %created.name, "Archive created");
        Ok(created)
    }

    /// Persist changed name, path or comment
    pub async fn update_archive(&self, archive: Archive) -> anyhow::Result<Archive> {
        if !Path::new(&archive.path).is_dir() {
            anyhow::bail!("archive path {} is not a directory", archive.path);
        }
        let _guard = self.runs.try_begin(archive.id, RunKind::Update)?;

        let store = self.store.clone();
        let updated = blocking(move || Ok(store.update(&archive)?)).await?;

        if let Err(e) = self.cache.put(Some(updated.clone())) {
            warn!(archive_id = updated.id, error = %e, "Failed to update archive cache");
        }
        info!(archive_id = updated.id, "Archive updated");
        Ok(updated)
    }

    /// Forget every snapshot of the archive, then delete it and its records
    pub async fn delete_archive(&self, id: ArchiveId) -> anyhow::Result<()> {
        let _guard = self.runs.try_begin(id, RunKind::Forget)?;

        let snapshots: Vec<String> = self
            .records_for(id)
            .await?
            .into_iter()
            .map(|r| r.snapshot)
            .collect();
        if !snapshots.is_empty() {
            self.restic.forget(&snapshots).await?;
        }

        let store = self.store.clone();
        blocking(move || Ok(ArchiveStore::delete(&store, id)?)).await?;

        if let Err(e) = self.cache.delete(id) {
            warn!(archive_id = id, error = %e, "Failed to evict archive from cache");
        }
        info!(archive_id = id, snapshots = snapshots.len(), "Archive deleted");
        Ok(())
    }

    pub async fn start_backup(&self, id: ArchiveId) -> anyhow::Result<ArchiveRun> {
        let archive = self.archive(id).await?;
        let guard = self.runs.try_begin(id, RunKind::Backup)?;
        let handle = self.restic.backup(Path::new(&archive.path)).await?;
        Ok(ArchiveRun::new(archive, RunKind::Backup, handle, guard))
    }

    /// Wait for a backup and record its snapshot
    pub async fn finish_backup(
        &self,
        mut run: ArchiveRun,
        comment: &str,
    ) -> anyhow::Result<BackupRecord> {
        let archive_id = run.archive.id;
        let outcome = run.drain().await;

        let snapshot = match outcome {
            RunOutcome::Succeeded {
                snapshot_id: Some(snapshot),
                ..
            } => snapshot,
            RunOutcome::Succeeded { .. } => {
                anyhow::bail!("backup of archive {archive_id} finished without a snapshot id")
            }
            failed => return Err(run_failure(archive_id, &failed)),
        };

        let store = self.store.clone();
        let comment = comment.to_string();
        let record =
            blocking(move || Ok(store.create_record(archive_id, &snapshot, &comment)?)).await?;

        info!(archive_id, snapshot = %record.snapshot, "Backup recorded");
        Ok(record)
    }

    /// Back up an archive to completion, handing progress to `on_event`
    pub async fn backup(
        &self,
        id: ArchiveId,
        comment: &str,
        mut on_event: impl FnMut(&BackupMessage),
    ) -> anyhow::Result<BackupRecord> {
        let mut run = self.start_backup(id).await?;
        while let Some(msg) = run.recv().await {
            on_event(&msg);
        }
        self.finish_backup(run, comment).await
    }

    /// Restore a backup over its archive's directory
    pub async fn start_restore(&self, record_id: i64) -> anyhow::Result<ArchiveRun> {
        let record = self.record(record_id).await?;
        let archive = self.archive(record.archive_id).await?;
        let guard = self.runs.try_begin(archive.id, RunKind::Restore)?;
        let handle = self
            .restic
            .restore(&record.snapshot, Path::new(&archive.path))
            .await?;
        Ok(ArchiveRun::new(archive, RunKind::Restore, handle, guard))
    }

    pub async fn finish_restore(&self, run: ArchiveRun) -> anyhow::Result<()> {
        let archive_id = run.archive.id;
        let outcome = run.finish().await;
        if !outcome.is_success() {
            return Err(run_failure(archive_id, &outcome));
        }
        info!(archive_id, "Restore finished");
        Ok(())
    }

    pub async fn restore(
        &self,
        record_id: i64,
        mut on_event: impl FnMut(&BackupMessage),
    ) -> anyhow::Result<()> {
        let mut run = self.start_restore(record_id).await?;
        while let Some(msg) = run.recv().await {
            on_event(&msg);
        }
        self.finish_restore(run).await
    }

    /// Forget a backup's snapshot and delete its record
    pub async fn delete_backup(&self, record_id: i64) -> anyhow::Result<()> {
        let record = self.record(record_id).await?;
        let _guard = self.runs.try_begin(record.archive_id, RunKind::Forget)?;

        self.restic.forget(std::slice::from_ref(&record.snapshot)).await?;

        let store = self.store.clone();
        blocking(move || Ok(store.delete_record(record_id)?)).await?;
        info!(record_id, snapshot = %record.snapshot, "Backup deleted");
        Ok(())
    }

    pub async fn record(&self, record_id: i64) -> anyhow::Result<BackupRecord> {
        let store = self.store.clone();
        blocking(move || {
            store
                .find_record(record_id)?
                .ok_or_else(|| anyhow::Error::from(StoreError::RecordMissing(record_id)))
        })
        .await
    }

    /// Backups of an archive, newest first
    pub async fn records_for(&self, archive_id: ArchiveId) -> anyhow::Result<Vec<BackupRecord>> {
        let store = self.store.clone();
        blocking(move || Ok(store.records_for(archive_id)?)).await
    }

    pub async fn update_record_comment(
        &self,
        record_id: i64,
        comment: &str,
    ) -> anyhow::Result<BackupRecord> {
        let store = self.store.clone();
        let comment = comment.to_string();
        blocking(move || Ok(store.update_record(record_id, &comment)?)).await
    }

    pub async fn snapshot_stats(&self, record_id: i64) -> anyhow::Result<SnapshotStats> {
        let record = self.record(record_id).await?;
        let (raw, restore) = tokio::try_join!(
            self.restic.raw_data_stats(&record.snapshot),
            self.restic.restore_size_stats(&record.snapshot),
        )?;
        Ok(SnapshotStats { raw, restore })
    }

    /// Cancel whatever runs on the archive
    pub fn cancel(&self, archive_id: ArchiveId) -> bool {
        self.runs.cancel(archive_id)
    }
}

fn run_failure(archive_id: ArchiveId, outcome: &RunOutcome) -> anyhow::Error {
    match outcome.error() {
        Some(cause) => {
            warn!(archive_id, raw = %cause.raw_output(), "Restic run failed");
            anyhow::Error::new(cause)
        }
        None => anyhow::anyhow!("restic run for archive {archive_id} failed"),
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
