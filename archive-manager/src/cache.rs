//! In-memory mirror of the archive table.
//!
//! The map is advisory: the store stays authoritative and every write goes to the
//! store first. One `RwLock` guards the whole map; the store is never called while
//! the lock is held.

use crate::error::StoreError;
use crate::models::{Archive, ArchiveId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type ArchiveMap = HashMap<ArchiveId, Arc<Archive>>;

/// Persistence the cache reads through
pub trait ArchiveStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<Archive>, StoreError>;
    fn find_by_id(&self, id: ArchiveId) -> Result<Option<Archive>, StoreError>;
    fn create(&self, archive: &Archive) -> Result<Archive, StoreError>;
    fn update(&self, archive: &Archive) -> Result<Archive, StoreError>;
    fn delete(&self, id: ArchiveId) -> Result<(), StoreError>;
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("archive id 0 cannot be used as a cache key")]
    InvalidKey,

    #[error("no archive given")]
    InvalidValue,

    #[error("archive {0} not found")]
    NotFound(ArchiveId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A point write, kept while a refresh is reading the store
#[derive(Clone)]
enum PointWrite {
    Put(Arc<Archive>),
    Delete(ArchiveId),
}

#[derive(Default)]
struct Entries {
    map: ArchiveMap,
    /// Bumped by every point write
    generation: u64,
    /// Refreshes currently reading the store
    refreshing: usize,
    /// Point writes made while `refreshing > 0`, tagged with their generation
    journal: Vec<(u64, PointWrite)>,
}

impl Entries {
    fn apply(&mut self, write: PointWrite) {
        self.generation += 1;
        match &write {
            PointWrite::Put(archive) => {
                self.map.insert(archive.id, Arc::clone(archive));
            }
            PointWrite::Delete(id) => {
                self.map.remove(id);
            }
        }
        if self.refreshing > 0 {
            self.journal.push((self.generation, write));
        }
    }
}

pub struct ArchiveCache<S> {
    store: S,
    entries: RwLock<Entries>,
}

impl<S: ArchiveStore> ArchiveCache<S> {
    /// Empty cache; call [`refresh`](Self::refresh) to load it
    pub fn new(store: S) -> Self {
        Self {
            store,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole map with the store's contents.
    ///
    /// Point writes that land while the store is being read are replayed onto
    /// the new map, so they are not lost. On a store error the current contents
    /// stay as they are.
    pub fn refresh(&self) -> Result<usize, CacheError> {
        let since = {
            let mut entries = self.write();
            entries.refreshing += 1;
            entries.generation
        };

        let loaded = self.store.find_all();

        let mut entries = self.write();
        entries.refreshing -= 1;
        let result = loaded.map(|archives| {
            let mut fresh = HashMap::with_capacity(archives.len());
            for archive in archives {
                if archive.id == 0 {
                    tracing::warn!(name = %archive.name, "Store returned an archive without id, skipping");
                    continue;
                }
                fresh.insert(archive.id, Arc::new(archive));
            }

            let mut replayed = 0;
            for (_, write) in entries.journal.iter().filter(|(generation, _)| *generation > since) {
                replayed += 1;
                match write {
                    PointWrite::Put(archive) => {
                        fresh.insert(archive.id, Arc::clone(archive));
                    }
                    PointWrite::Delete(id) => {
                        fresh.remove(id);
                    }
                }
            }
            if replayed > 0 {
                tracing::debug!(replayed, "Replayed writes made during refresh");
            }

            let count = fresh.len();
            entries.map = fresh;
            count
        });
        if entries.refreshing == 0 {
            entries.journal.clear();
        }
        drop(entries);

        let count = result?;
        tracing::debug!(archives = count, "Archive cache refreshed");
        Ok(count)
    }

    pub fn get(&self, id: ArchiveId) -> Result<Arc<Archive>, CacheError> {
        if id == 0 {
            return Err(CacheError::InvalidKey);
        }
        self.read()
            .map
            .get(&id)
            .cloned()
            .ok_or(CacheError::NotFound(id))
    }

    /// Independent copy of the map; later cache writes do not show up in it
    pub fn get_all(&self) -> ArchiveMap {
        self.read().map.clone()
    }

    pub fn put(&self, archive: Option<Archive>) -> Result<(), CacheError> {
        let archive = archive.ok_or(CacheError::InvalidValue)?;
        if archive.id == 0 {
            return Err(CacheError::InvalidKey);
        }
        self.write().apply(PointWrite::Put(Arc::new(archive)));
        Ok(())
    }

    /// Removing an absent id succeeds
    pub fn delete(&self, id: ArchiveId) -> Result<(), CacheError> {
        if id == 0 {
            return Err(CacheError::InvalidKey);
        }
        self.write().apply(PointWrite::Delete(id));
        Ok(())
    }

    pub fn exists(&self, id: ArchiveId) -> bool {
        id != 0 && self.read().map.contains_key(&id)
    }

    /// Return the cached archive for `id`, or build one with `create` and cache it.
    ///
    /// `create` runs without any lock held, so concurrent callers may both run it.
    /// The entry is then re-checked under the id `create` produced: the first value
    /// inserted wins and every caller gets that one. Id 0 always calls `create`.
    pub fn get_or_create<F, E>(&self, id: ArchiveId, create: F) -> Result<Arc<Archive>, E>
    where
        F: FnOnce() -> Result<Archive, E>,
        E: From<CacheError>,
    {
        if id != 0 {
            if let Some(found) = self.read().map.get(&id) {
                return Ok(Arc::clone(found));
            }
        }

        let created = create()?;
        let key = created.id;
        if key == 0 {
            return Err(CacheError::InvalidKey.into());
        }

        let mut entries = self.write();
        if let Some(existing) = entries.map.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(created);
        entries.apply(PointWrite::Put(Arc::clone(&created)));
        Ok(created)
    }

    /// Drop every entry; maps returned by `get_all` are unaffected
    pub fn clear(&self) {
        self.write().map = HashMap::new();
    }

    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().map.is_empty()
    }
}
