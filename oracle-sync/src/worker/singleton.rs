// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::lock::DistributedLock;
use super::queue::Job;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::utils::now_millis;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, error, warn};

/// Work performed for one chain when its job comes up.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> SyncResult<()>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(SyncError),
    /// Older than its interval, dropped without running.
    Stale,
    /// Another worker holds the chain lock.
    Locked,
    Panicked,
}

/// Runs at most one job per chain at a time, across every worker sharing the
/// same lock backend.
///
/// The chain lock is renewed every third of its TTL while the job runs, so
/// the TTL only bounds how long a crashed holder blocks the chain. A job
/// whose lock cannot be renewed is dropped.
pub struct SingletonWorker {
    lock: Arc<dyn DistributedLock>,
    metrics: Arc<SyncMetrics>,
    instance: String,
    sequence: AtomicU64,
}

impl SingletonWorker {
    pub fn new(lock: Arc<dyn DistributedLock>, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            lock,
            metrics,
            instance: format!("{}-{}", std::process::id(), now_millis()),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_owner(&self) -> String {
        format!(
            "{}:{}",
            self.instance,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub async fn apply(&self, job: &Job, handler: &dyn JobHandler) -> JobOutcome {
        let chain = job.chain_id.as_str();
        if job.is_stale(now_millis()) {
            debug!(
                "[Worker][{}] Discarding job enqueued at {}ms, older than {}ms",
                chain, job.enqueued_at_ms, job.interval_ms
            );
            self.metrics
                .job_stale_discards
                .with_label_values(&[chain])
                .inc();
            return JobOutcome::Stale;
        }

        let owner = self.next_owner();
        let ttl = Duration::from_millis(job.lock_ttl_ms);
        match self.lock.acquire(chain, &owner, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("[Worker][{}] Lock held elsewhere, skipping", chain);
                self.metrics.job_lock_misses.with_label_values(&[chain]).inc();
                return JobOutcome::Locked;
            }
            Err(e) => {
                warn!("[Worker][{}] Failed to acquire lock: {}", chain, e);
                self.record_error(chain, &e);
                return JobOutcome::Failed(e);
            }
        }

        let started = Instant::now();
        let result = tokio::select! {
            result = AssertUnwindSafe(handler.handle(job)).catch_unwind() => result,
            lost = self.keep_alive(chain, &owner, ttl) => Ok(Err(lost)),
        };
        self.metrics
            .job_latency
            .with_label_values(&[chain])
            .observe(started.elapsed().as_secs_f64());
        self.metrics.job_executions.with_label_values(&[chain]).inc();

        if let Err(e) = self.lock.release(chain, &owner).await {
            // the TTL frees the name eventually
            warn!("[Worker][{}] Failed to release lock: {}", chain, e);
        }

        match result {
            Ok(Ok(())) => {
                debug!(
                    "[Worker][{}] Job done in {:?}",
                    chain,
                    started.elapsed()
                );
                JobOutcome::Completed
            }
            Ok(Err(e)) => {
                if e.is_transient() {
                    warn!("[Worker][{}] Job failed, will retry next cycle: {}", chain, e);
                } else {
                    error!("[Worker][{}] Job failed: {}", chain, e);
                }
                self.record_error(chain, &e);
                JobOutcome::Failed(e)
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("[Worker][{}] Job panicked: {}", chain, msg);
                self.metrics
                    .job_errors
                    .with_label_values(&[chain, "panic"])
                    .inc();
                JobOutcome::Panicked
            }
        }
    }

    /// Extends the lock until it is lost, then returns why.
    async fn keep_alive(&self, chain: &str, owner: &str, ttl: Duration) -> SyncError {
        let mut renew = time::interval((ttl / 3).max(Duration::from_millis(1)));
        // the first tick completes immediately
        renew.tick().await;
        loop {
            renew.tick().await;
            match self.lock.extend(chain, owner, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    return SyncError::Internal(format!("lock on {} lost while running", chain))
                }
                // the lock is still valid until its last expiry
                Err(e) => warn!("[Worker][{}] Failed to extend lock: {}", chain, e),
            }
        }
    }

    fn record_error(&self, chain: &str, e: &SyncError) {
        self.metrics
            .job_errors
            .with_label_values(&[chain, e.error_type()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::lock::InMemoryLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct BlockingHandler {
        started: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for BlockingHandler {
        async fn handle(&self, _job: &Job) -> SyncResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct FixedHandler(SyncResult<()>);

    #[async_trait]
    impl JobHandler for FixedHandler {
        async fn handle(&self, _job: &Job) -> SyncResult<()> {
            self.0.clone()
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _job: &Job) -> SyncResult<()> {
            panic!("handler exploded");
        }
    }

    /// Sleeps for five minutes and tracks how many runs overlap.
    #[derive(Default)]
    struct SlowHandler {
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> SyncResult<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(300)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Grants every lock but never renews it.
    struct UnrenewableLock;

    #[async_trait]
    impl DistributedLock for UnrenewableLock {
        async fn acquire(&self, _name: &str, _owner: &str, _ttl: Duration) -> SyncResult<bool> {
            Ok(true)
        }

        async fn extend(&self, _name: &str, _owner: &str, _ttl: Duration) -> SyncResult<bool> {
            Ok(false)
        }

        async fn release(&self, _name: &str, _owner: &str) -> SyncResult<bool> {
            Ok(false)
        }
    }

    fn fresh_job(chain_id: &str) -> Job {
        Job {
            chain_id: chain_id.to_string(),
            lock_ttl_ms: 60_000,
            interval_ms: 5_000,
            enqueued_at_ms: now_millis(),
        }
    }

    fn worker() -> (Arc<SingletonWorker>, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new_for_testing());
        (
            Arc::new(SingletonWorker::new(
                Arc::new(InMemoryLock::new()),
                metrics.clone(),
            )),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_concurrent_jobs_for_one_chain_run_once() {
        let (worker, metrics) = worker();
        let handler = Arc::new(BlockingHandler {
            started: Notify::new(),
            release: Notify::new(),
            runs: AtomicUsize::new(0),
        });

        let first = {
            let worker = worker.clone();
            let handler = handler.clone();
            tokio::spawn(async move { worker.apply(&fresh_job("bsc"), handler.as_ref()).await })
        };
        handler.started.notified().await;

        let second = worker.apply(&fresh_job("bsc"), handler.as_ref()).await;
        assert_eq!(second, JobOutcome::Locked);
        // a different chain is not blocked
        let other = worker
            .apply(&fresh_job("ethereum"), &FixedHandler(Ok(())))
            .await;
        assert_eq!(other, JobOutcome::Completed);

        handler.release.notify_one();
        assert_eq!(first.await.unwrap(), JobOutcome::Completed);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            metrics.job_lock_misses.with_label_values(&["bsc"]).get(),
            1
        );

        // the lock is free again
        let third = worker.apply(&fresh_job("bsc"), &FixedHandler(Ok(()))).await;
        assert_eq!(third, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_stale_job_is_discarded() {
        let (worker, metrics) = worker();
        let mut job = fresh_job("bsc");
        job.enqueued_at_ms = now_millis() - 10_000;
        let outcome = worker.apply(&job, &PanickingHandler).await;
        assert_eq!(outcome, JobOutcome::Stale);
        assert_eq!(
            metrics.job_stale_discards.with_label_values(&["bsc"]).get(),
            1
        );
        assert_eq!(metrics.job_executions.with_label_values(&["bsc"]).get(), 0);
    }

    #[tokio::test]
    async fn test_failure_and_panic_release_the_lock() {
        let (worker, metrics) = worker();
        let err = SyncError::Rpc("down".into());
        let outcome = worker
            .apply(&fresh_job("bsc"), &FixedHandler(Err(err.clone())))
            .await;
        assert_eq!(outcome, JobOutcome::Failed(err));
        assert_eq!(
            metrics.job_errors.with_label_values(&["bsc", "rpc"]).get(),
            1
        );

        let outcome = worker.apply(&fresh_job("bsc"), &PanickingHandler).await;
        assert_eq!(outcome, JobOutcome::Panicked);
        assert_eq!(
            metrics.job_errors.with_label_values(&["bsc", "panic"]).get(),
            1
        );

        let outcome = worker.apply(&fresh_job("bsc"), &FixedHandler(Ok(()))).await;
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(metrics.job_executions.with_label_values(&["bsc"]).get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_outliving_the_ttl_keeps_the_chain_exclusive() {
        let (worker, metrics) = worker();
        let handler = Arc::new(SlowHandler::default());
        let mut tasks = vec![];
        // one job every 61s against a 60s TTL while the first still runs
        for _ in 0..4 {
            let worker = worker.clone();
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                worker.apply(&fresh_job("ethereum"), handler.as_ref()).await
            }));
            tokio::time::sleep(Duration::from_secs(61)).await;
        }
        let mut outcomes = vec![];
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        assert_eq!(outcomes[0], JobOutcome::Completed);
        assert!(outcomes[1..].iter().all(|o| *o == JobOutcome::Locked));
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(
            metrics.job_lock_misses.with_label_values(&["ethereum"]).get(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_is_dropped_when_its_lock_is_lost() {
        let metrics = Arc::new(SyncMetrics::new_for_testing());
        let worker = SingletonWorker::new(Arc::new(UnrenewableLock), metrics.clone());
        let handler = SlowHandler::default();
        let outcome = worker.apply(&fresh_job("ethereum"), &handler).await;
        assert!(matches!(outcome, JobOutcome::Failed(SyncError::Internal(_))));
        // dropped at the first renewal, long before the handler finished
        assert_eq!(handler.running.load(Ordering::SeqCst), 1);
        assert_eq!(
            metrics
                .job_errors
                .with_label_values(&["ethereum", "internal"])
                .get(),
            1
        );
    }
}
