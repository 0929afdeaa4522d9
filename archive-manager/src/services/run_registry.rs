//! Tracks which archives have a restic operation in flight.
//!
//! An archive can run one operation at a time. A slot is claimed with
//! [`RunRegistry::try_begin`] and released when the returned guard drops.

use crate::models::ArchiveId;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Restore,
    Forget,
    Update,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunKind::Backup => "backup",
            RunKind::Restore => "restore",
            RunKind::Forget => "forget",
            RunKind::Update => "update",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    kind: RunKind,
    started_at: DateTime<Utc>,
    cancel: Option<CancellationToken>,
}

/// Snapshot of one active run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    pub archive_id: ArchiveId,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("archive {archive_id} is busy: {kind} in progress")]
pub struct Busy {
    pub archive_id: ArchiveId,
    pub kind: RunKind,
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    active: DashMap<ArchiveId, Slot>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the archive's slot, failing if another run holds it
    pub fn try_begin(self: &Arc<Self>, archive_id: ArchiveId, kind: RunKind) -> Result<RunGuard, Busy> {
        match self.active.entry(archive_id) {
            Entry::Occupied(existing) => Err(Busy {
                archive_id,
                kind: existing.get().kind,
            }),
            Entry::Vacant(slot) => {
                slot.insert(Slot {
                    kind,
                    started_at: Utc::now(),
                    cancel: None,
                });
                tracing::debug!(archive_id, %kind, "Run slot claimed");
                Ok(RunGuard {
                    registry: Arc::clone(self),
                    archive_id,
                })
            }
        }
    }

    pub fn is_running(&self, archive_id: ArchiveId) -> bool {
        self.active.contains_key(&archive_id)
    }

    /// Cancel the archive's run; false if nothing cancellable is running
    pub fn cancel(&self, archive_id: ArchiveId) -> bool {
        let token = self
            .active
            .get(&archive_id)
            .and_then(|slot| slot.cancel.clone());
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(archive_id, "Run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every active run
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = self
            .active
            .iter()
            .filter_map(|slot| slot.cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn active(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .active
            .iter()
            .map(|slot| ActiveRun {
                archive_id: *slot.key(),
                kind: slot.kind,
                started_at: slot.started_at,
            })
            .collect();
        runs.sort_by_key(|r| r.archive_id);
        runs
    }
}

/// Holds an archive's run slot until dropped
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    archive_id: ArchiveId,
}

impl RunGuard {
    /// Make the run cancellable through the registry
    pub fn set_cancel(&self, token: CancellationToken) {
        if let Some(mut slot) = self.registry.active.get_mut(&self.archive_id) {
            slot.cancel = Some(token);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.active.remove(&self.archive_id);
        tracing::debug!(archive_id = self.archive_id, "Run slot released");
    }
}
