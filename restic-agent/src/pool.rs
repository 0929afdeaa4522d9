//! Bounded object pool with LIFO reuse and periodic trimming.
//!
//! Released objects go onto a primary list capped at `max_retain`. Overflow spills
//! into a loosely bounded fallback list instead of being dropped straight away,
//! which keeps churn down during bursts. A background task trims the primary list
//! back to `min_retain` every `cleanup_interval` and empties the fallback list.
//!
//! After [`Pool::close`] the pool is inert: `release` drops values, `acquire`
//! always builds a fresh value and `size` reports zero.

use crate::utils::{AgentError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fallback list may hold this many times `max_retain` objects
const FALLBACK_FACTOR: usize = 4;

/// Retention limits for a [`Pool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum objects kept on the primary list
    pub max_retain: usize,
    /// Cleanup never trims the primary list below this
    pub min_retain: usize,
    /// Period of the background trim
    pub cleanup_interval: Duration,
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.min_retain > self.max_retain {
            return Err(AgentError::Config(format!(
                "pool min_retain ({}) exceeds max_retain ({})",
                self.min_retain, self.max_retain
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(AgentError::Config(
                "pool cleanup interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retain: 16,
            min_retain: 2,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct Lists<T> {
    entries: Vec<T>,
    fallback: Vec<T>,
    closed: bool,
}

struct PoolInner<T> {
    lists: Mutex<Lists<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    config: PoolConfig,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, Lists<T>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trim(&self) -> usize {
        let mut lists = self.lock();
        if lists.closed {
            return 0;
        }
        let mut removed = lists.fallback.len();
        lists.fallback.clear();
        if lists.entries.len() > self.config.min_retain {
            // Oldest objects sit at the bottom of the stack; keep those, drop the top
            removed += lists.entries.len() - self.config.min_retain;
            lists.entries.truncate(self.config.min_retain);
        }
        removed
    }
}

/// Thread-safe pool of reusable `T` values
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
    cleanup: CancellationToken,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool and start its cleanup task on the current tokio runtime.
    ///
    /// Outside a runtime the pool still works, it just never trims on its own.
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            lists: Mutex::new(Lists {
                entries: Vec::with_capacity(config.max_retain),
                fallback: Vec::new(),
                closed: false,
            }),
            factory: Box::new(factory),
            config,
        });
        let cleanup = CancellationToken::new();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup_worker(Arc::downgrade(&inner), cleanup.clone()));
            }
            Err(_) => warn!("No tokio runtime available, pool cleanup disabled"),
        }

        Ok(Self { inner, cleanup })
    }
}

impl<T> Pool<T> {
    /// Take the most recently released object, or build a new one
    pub fn acquire(&self) -> T {
        {
            let mut lists = self.inner.lock();
            if !lists.closed {
                if let Some(item) = lists.entries.pop() {
                    return item;
                }
                if let Some(item) = lists.fallback.pop() {
                    return item;
                }
            }
        }
        (self.inner.factory)()
    }

    /// Hand an object back for reuse
    pub fn release(&self, item: T) {
        let mut lists = self.inner.lock();
        if lists.closed {
            return;
        }

        lists.entries.push(item);
        if lists.entries.len() > self.inner.config.max_retain {
            if let Some(excess) = lists.entries.pop() {
                if lists.fallback.len() < self.inner.config.max_retain * FALLBACK_FACTOR {
                    lists.fallback.push(excess);
                }
            }
        }
    }

    /// Number of objects on the primary list
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Run one cleanup pass now; returns how many objects were dropped
    pub fn cleanup(&self) -> usize {
        self.inner.trim()
    }

    /// Stop the cleanup task and drop every retained object
    pub fn close(&self) {
        self.cleanup.cancel();
        let mut lists = self.inner.lock();
        lists.closed = true;
        lists.entries.clear();
        lists.fallback.clear();
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        self.cleanup.cancel();
    }
}

async fn cleanup_worker<T>(inner: Weak<PoolInner<T>>, cancel: CancellationToken) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.cleanup_interval,
        None => return,
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let removed = inner.trim();
                if removed > 0 {
                    debug!(removed, "Pool cleanup trimmed retained objects");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_retain: usize, min_retain: usize) -> PoolConfig {
        PoolConfig {
            max_retain,
            min_retain,
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    fn counting_pool(cfg: PoolConfig) -> (Pool<Vec<u8>>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let pool = Pool::new(cfg, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::with_capacity(64)
        })
        .unwrap();
        (pool, built)
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Pool::new(config(1, 2), Vec::<u8>::new).is_err());
        let zero = PoolConfig {
            cleanup_interval: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(Pool::new(zero, Vec::<u8>::new).is_err());
    }

    #[tokio::test]
    async fn test_acquire_builds_when_empty() {
        let (pool, built) = counting_pool(config(4, 1));
        let _a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses_same_instance() {
        let (pool, built) = counting_pool(config(4, 1));
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"marker");
        let ptr = buf.as_ptr();

        pool.release(buf);
        assert_eq!(pool.size(), 1);

        let again = pool.acquire();
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again, b"marker");
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let pool = Pool::new(config(4, 0), Vec::<u8>::new).unwrap();
        pool.release(vec![1]);
        pool.release(vec![2]);
        pool.release(vec![3]);
        assert_eq!(pool.acquire(), vec![3]);
        assert_eq!(pool.acquire(), vec![2]);
        assert_eq!(pool.acquire(), vec![1]);
    }

    #[tokio::test]
    async fn test_overflow_spills_to_fallback() {
        let (pool, built) = counting_pool(config(2, 0));
        pool.release(vec![1]);
        pool.release(vec![2]);
        pool.release(vec![3]);
        assert_eq!(pool.size(), 2);

        // Primary first, then the spilled object, then the factory
        assert_eq!(pool.acquire(), vec![2]);
        assert_eq!(pool.acquire(), vec![1]);
        assert_eq!(pool.acquire(), vec![3]);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        pool.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_trims_to_min_retain() {
        let pool = Pool::new(config(8, 3), Vec::<u8>::new).unwrap();
        for i in 0..6u8 {
            pool.release(vec![i]);
        }
        assert_eq!(pool.size(), 6);

        assert_eq!(pool.cleanup(), 3);
        assert_eq!(pool.size(), 3);

        // Never below the minimum
        assert_eq!(pool.cleanup(), 0);
        assert_eq!(pool.size(), 3);

        // The oldest objects are the ones kept
        assert_eq!(pool.acquire(), vec![2]);
    }

    #[tokio::test]
    async fn test_cleanup_leaves_small_pool_alone() {
        let pool = Pool::new(config(8, 3), Vec::<u8>::new).unwrap();
        pool.release(vec![0]);
        pool.release(vec![1]);
        assert_eq!(pool.cleanup(), 0);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_background_cleanup_runs() {
        let cfg = PoolConfig {
            max_retain: 8,
            min_retain: 1,
            cleanup_interval: Duration::from_millis(20),
        };
        let pool = Pool::new(cfg, Vec::<u8>::new).unwrap();
        for i in 0..5u8 {
            pool.release(vec![i]);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_close_is_inert() {
        let (pool, built) = counting_pool(config(4, 1));
        pool.release(vec![1]);
        pool.close();
        assert_eq!(pool.size(), 0);

        pool.release(vec![2]);
        assert_eq!(pool.size(), 0);

        let _fresh = pool.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(pool.cleanup(), 0);
    }

    #[test]
    fn test_concurrent_release_and_acquire() {
        let pool = Arc::new(Pool::new(config(16, 2), Vec::<u8>::new).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.acquire();
                        pool.release(buf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.size() <= 16);
    }
}
