pub mod archives;
pub mod cache_refresh;
pub mod run_registry;
pub mod scheduler;
