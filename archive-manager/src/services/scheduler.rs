//! Fixed-interval task scheduler.
//!
//! Every task gets its own loop. A run is spawned as a separate tokio task, so a
//! panic or error is logged and the loop carries on; other loops never notice.

use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub trait Task: Send + Sync + 'static {
    /// Unique name; adding a task with a known key replaces the old one
    fn key(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Run once as soon as the loop starts instead of waiting one interval
    fn execute_immediately(&self) -> bool {
        false
    }

    fn run(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

struct Entry {
    task: Arc<dyn Task>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<String, Entry>,
    root: Option<CancellationToken>,
}

#[derive(Default)]
pub struct TaskScheduler {
    inner: Mutex<Inner>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task. After [`start`](Self::start) its loop begins right away.
    pub fn add_task(&self, task: Arc<dyn Task>) -> anyhow::Result<()> {
        if task.interval().is_zero() {
            anyhow::bail!("task {} has a zero interval", task.key());
        }

        let key = task.key().to_string();
        let mut inner = self.lock();
        let cancel = match &inner.root {
            Some(root) => {
                let token = root.child_token();
                tokio::spawn(task_loop(Arc::clone(&task), token.clone()));
                token
            }
            None => CancellationToken::new(),
        };

        if let Some(old) = inner.tasks.insert(key.clone(), Entry { task, cancel }) {
            old.cancel.cancel();
            tracing::info!(task = %key, "Replaced scheduled task");
        } else {
            tracing::info!(task = %key, "Scheduled task added");
        }
        Ok(())
    }

    /// Stop and forget a task; returns whether it existed
    pub fn remove_task(&self, key: &str) -> bool {
        match self.lock().tasks.remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(task = %key, "Scheduled task removed");
                true
            }
            None => false,
        }
    }

    pub fn for_each_task(&self, mut f: impl FnMut(&dyn Task)) {
        for entry in self.lock().tasks.values() {
            f(entry.task.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Start every registered loop. Cancelling `shutdown` stops them all.
    pub fn start(&self, shutdown: CancellationToken) {
        let mut inner = self.lock();
        if inner.root.is_some() {
            tracing::warn!("Task scheduler already started");
            return;
        }

        for entry in inner.tasks.values_mut() {
            entry.cancel = shutdown.child_token();
            tokio::spawn(task_loop(Arc::clone(&entry.task), entry.cancel.clone()));
        }
        tracing::info!(count = inner.tasks.len(), "Task scheduler started");
        inner.root = Some(shutdown);
    }
}

async fn task_loop(task: Arc<dyn Task>, cancel: CancellationToken) {
    let period = task.interval();
    let first = if task.execute_immediately() {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => run_once(&task).await,
        }
    }
    tracing::debug!(task = %task.key(), "Task loop stopped");
}

async fn run_once(task: &Arc<dyn Task>) {
    let key = task.key().to_string();
    let runner = Arc::clone(task);

    match tokio::spawn(async move { runner.run().await }).await {
        Ok(Ok(())) => tracing::debug!(task = %key, "Task run finished"),
        Ok(Err(e)) => tracing::warn!(task = %key, error = %e, "Task run failed"),
        Err(e) if e.is_panic() => tracing::error!(task = %key, "Task run panicked"),
        Err(e) => tracing::warn!(task = %key, error = %e, "Task run aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        key: String,
        interval: Duration,
        immediate: bool,
        panics: bool,
        runs: Arc<AtomicUsize>,
    }

    impl Counting {
        fn new(key: &str, interval_ms: u64) -> (Arc<Self>, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let task = Arc::new(Self {
                key: key.to_string(),
                interval: Duration::from_millis(interval_ms),
                immediate: false,
                panics: false,
                runs: Arc::clone(&runs),
            });
            (task, runs)
        }
    }

    impl Task for Counting {
        fn key(&self) -> &str {
            &self.key
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn execute_immediately(&self) -> bool {
            self.immediate
        }

        fn run(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.panics {
                    panic!("task {} blew up", self.key);
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let scheduler = TaskScheduler::new();
        let (task, _) = Counting::new("zero", 0);
        assert!(scheduler.add_task(task).is_err());
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_runs_every_interval() {
        let scheduler = TaskScheduler::new();
        let (task, runs) = Counting::new("tick", 20);
        scheduler.add_task(task).unwrap();

        let shutdown = CancellationToken::new();
        scheduler.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_execute_immediately() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(Arc::new(Counting {
                key: "now".into(),
                interval: Duration::from_secs(3600),
                immediate: true,
                panics: false,
                runs: Arc::clone(&runs),
            }))
            .unwrap();

        scheduler.start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let scheduler = TaskScheduler::new();
        let panicking = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(Arc::new(Counting {
                key: "bad".into(),
                interval: Duration::from_millis(20),
                immediate: true,
                panics: true,
                runs: Arc::clone(&panicking),
            }))
            .unwrap();
        let (good, good_runs) = Counting::new("good", 20);
        scheduler.add_task(good).unwrap();

        scheduler.start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The panicking loop keeps going, and so does its neighbour
        assert!(panicking.load(Ordering::SeqCst) >= 2);
        assert!(good_runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_remove_and_add_after_start() {
        let scheduler = TaskScheduler::new();
        scheduler.start(CancellationToken::new());

        let (task, runs) = Counting::new("late", 20);
        scheduler.add_task(task).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);

        assert!(scheduler.remove_task("late"));
        assert!(!scheduler.remove_task("late"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let frozen = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn test_for_each_task_and_replace() {
        let scheduler = TaskScheduler::new();
        let (a, _) = Counting::new("a", 1000);
        let (b, _) = Counting::new("b", 1000);
        let (a2, _) = Counting::new("a", 2000);
        scheduler.add_task(a).unwrap();
        scheduler.add_task(b).unwrap();
        scheduler.add_task(a2).unwrap();

        let mut seen = Vec::new();
        scheduler.for_each_task(|t| seen.push((t.key().to_string(), t.interval())));
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), Duration::from_millis(2000)),
                ("b".to_string(), Duration::from_millis(1000)),
            ]
        );
    }
}
