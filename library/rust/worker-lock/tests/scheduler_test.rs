use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use worker_lock::{
    CronWorker, DistributedLockManager, InMemoryLockStore, JobHandler, JobRun, LockManagerConfig,
    LockOptions, LockStore,
};

struct SlowJob {
    runs: AtomicU32,
    duration: Duration,
}

impl SlowJob {
    fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicU32::new(0),
            duration,
        })
    }
}

#[async_trait]
impl JobHandler for SlowJob {
    async fn run(&self) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

struct FailingJob;

#[async_trait]
impl JobHandler for FailingJob {
    async fn run(&self) -> anyhow::Result<()> {
        anyhow::bail!("deposit ledger unavailable")
    }
}

fn instance(store: Arc<dyn LockStore>, id: &str) -> DistributedLockManager {
    DistributedLockManager::new(
        LockManagerConfig::default()
            .with_endpoint("redis://127.0.0.1:6379")
            .with_instance_id(id)
            .with_default_retry_count(0),
        store,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_job_on_two_instances_runs_once() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let job = SlowJob::new(Duration::from_millis(150));

    let mut worker_a = CronWorker::new(instance(store.clone(), "a"));
    worker_a
        .register("candles:1m", "* * * * *", LockOptions::new(), job.clone())
        .unwrap();
    let mut worker_b = CronWorker::new(instance(store, "b"));
    worker_b
        .register("candles:1m", "* * * * *", LockOptions::new(), job.clone())
        .unwrap();

    let (a, b) = tokio::join!(worker_a.trigger("candles:1m"), worker_b.trigger("candles:1m"));
    let mut results = vec![a.unwrap(), b.unwrap()];
    results.sort_by_key(|r| matches!(r, JobRun::Skipped));

    assert_eq!(results, vec![JobRun::Completed, JobRun::Skipped]);
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_job_reports_error_and_releases_lock() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let manager = instance(store, "a");
    let mut worker = CronWorker::new(manager.clone());
    worker
        .register("deposits:credit", "*/5 * * * *", LockOptions::new(), Arc::new(FailingJob))
        .unwrap();

    let result = worker.trigger("deposits:credit").await.unwrap();
    assert_eq!(result, JobRun::Failed("deposit ledger unavailable".to_string()));
    assert!(!manager.exists("deposits:credit").await);
}

#[tokio::test]
async fn test_register_rejects_invalid_cron() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let mut worker = CronWorker::new(instance(store, "a"));
    let result = worker.register(
        "orders:expire",
        "every minute",
        LockOptions::new(),
        SlowJob::new(Duration::ZERO),
    );
    assert!(result.is_err());
    assert!(worker.job_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_worker_runs_due_jobs_until_stopped() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let job = SlowJob::new(Duration::ZERO);
    let mut worker = CronWorker::new(instance(store, "a"))
        .with_tick_interval(Duration::from_millis(100));
    worker
        .register("ticker", "* * * * * *", LockOptions::new(), job.clone())
        .unwrap();

    let handle = worker.start();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    worker.stop();
    handle.await.unwrap();

    let runs = job.runs.load(Ordering::SeqCst);
    assert!(runs >= 1, "expected at least one run, got {runs}");
    assert!(runs <= 3, "expected at most one run per second, got {runs}");
}
