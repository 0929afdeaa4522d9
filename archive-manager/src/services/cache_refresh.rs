use crate::cache::{ArchiveCache, ArchiveStore};
use crate::services::scheduler::Task;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub const CACHE_REFRESH_TASK: &str = "archive-cache-refresh";

/// Periodically reloads the archive cache from the store
pub struct CacheRefreshTask<S> {
    cache: Arc<ArchiveCache<S>>,
    interval: Duration,
}

impl<S> CacheRefreshTask<S> {
    pub fn new(cache: Arc<ArchiveCache<S>>, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

impl<S: ArchiveStore + 'static> Task for CacheRefreshTask<S> {
    fn key(&self) -> &str {
        CACHE_REFRESH_TASK
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            let count = tokio::task::spawn_blocking(move || cache.refresh()).await??;
            tracing::debug!(archives = count, "Periodic cache refresh done");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::SqliteStore;
    use crate::models::Archive;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_picks_up_new_rows() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("archive.sqlite")).unwrap();
        let cache = Arc::new(ArchiveCache::new(store.clone()));
        let task = CacheRefreshTask::new(Arc::clone(&cache), Duration::from_secs(60));

        task.run().await.unwrap();
        assert!(cache.is_empty());

        // Written behind the cache's back
        store.create(&Archive::new("A", "/a", "")).unwrap();
        task.run().await.unwrap();
        assert_eq!(cache.len(), 1);
    }
}
