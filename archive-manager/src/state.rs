use crate::cache::ArchiveCache;
use crate::config::AppConfig;
use crate::db::store::SqliteStore;
use crate::services::archives::ArchiveService;
use crate::services::cache_refresh::CacheRefreshTask;
use crate::services::run_registry::RunRegistry;
use crate::services::scheduler::TaskScheduler;
use restic_agent::{Restic, ResticSettings, SharedSettings};
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub archives: ArchiveService,
    pub scheduler: TaskScheduler,
}

impl AppState {
    /// Open the database and restic settings, load the cache and register periodic tasks.
    ///
    /// Must run inside a tokio runtime.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        config.ensure_dirs()?;

        let defaults = ResticSettings::with_data_dir(&config.data_dir, &config.bin_dir);
        let settings = SharedSettings::open(&config.restic_config, &defaults)?;
        let restic = Arc::new(Restic::new(settings)?);

        let db_path = config.db_path.clone();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(&db_path)).await??;
        let cache = Arc::new(ArchiveCache::new(store.clone()));

        let archives = ArchiveService::new(store, Arc::clone(&cache), restic, Arc::new(RunRegistry::new()));
        let loaded = archives.refresh_cache().await?;
        tracing::info!(archives = loaded, "Archive cache loaded");

        let scheduler = TaskScheduler::new();
        scheduler.add_task(Arc::new(CacheRefreshTask::new(cache, config.cache_refresh)))?;

        Ok(Self {
            config,
            archives,
            scheduler,
        })
    }
}
