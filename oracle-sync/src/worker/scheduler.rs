// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::queue::{Job, JobQueue};
use super::singleton::{JobHandler, JobOutcome, SingletonWorker};
use crate::config::JobSchedule;
use crate::utils::now_millis;
use oracle_sync_schema::ChainId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Enqueues one job per chain every `interval`, and runs queued jobs on a
/// fixed pool of consumers.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    worker: Arc<SingletonWorker>,
    handlers: BTreeMap<ChainId, (JobSchedule, Arc<dyn JobHandler>)>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<SingletonWorker>) -> Self {
        Self {
            queue,
            worker,
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        chain_id: ChainId,
        schedule: JobSchedule,
        handler: Arc<dyn JobHandler>,
    ) {
        self.handlers.insert(chain_id, (schedule, handler));
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.handlers.keys().cloned().collect()
    }

    pub fn run(
        self,
        consumers: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut task_handles = vec![];
        for (chain_id, (schedule, _)) in self.handlers.iter() {
            task_handles.push(tokio::spawn(Self::run_producer(
                chain_id.clone(),
                schedule.clone(),
                self.queue.clone(),
                cancel.clone(),
            )));
        }
        let handlers: Arc<BTreeMap<ChainId, Arc<dyn JobHandler>>> = Arc::new(
            self.handlers
                .into_iter()
                .map(|(chain_id, (_, handler))| (chain_id, handler))
                .collect(),
        );
        for consumer in 0..consumers {
            task_handles.push(tokio::spawn(Self::run_consumer(
                consumer,
                self.queue.clone(),
                self.worker.clone(),
                handlers.clone(),
                cancel.clone(),
            )));
        }
        task_handles
    }

    async fn run_producer(
        chain_id: ChainId,
        schedule: JobSchedule,
        queue: Arc<dyn JobQueue>,
        cancel: CancellationToken,
    ) {
        info!(
            "[Scheduler][{}] Starting producer, interval {:?}",
            chain_id,
            schedule.interval()
        );
        let mut interval = time::interval(schedule.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Scheduler][{}] Producer cancelled", chain_id);
                    return;
                }
                _ = interval.tick() => {}
            }
            let job = Job {
                chain_id: chain_id.clone(),
                lock_ttl_ms: schedule.lock_ttl_ms,
                interval_ms: schedule.interval_ms,
                enqueued_at_ms: now_millis(),
            };
            if let Err(e) = queue.enqueue(job).await {
                error!("[Scheduler][{}] Failed to enqueue job: {}", chain_id, e);
                return;
            }
        }
    }

    async fn run_consumer(
        consumer: usize,
        queue: Arc<dyn JobQueue>,
        worker: Arc<SingletonWorker>,
        handlers: Arc<BTreeMap<ChainId, Arc<dyn JobHandler>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Scheduler] Consumer {} cancelled", consumer);
                    return;
                }
                job = queue.next() => job,
            };
            let Some(job) = job else {
                info!("[Scheduler] Queue closed, consumer {} exiting", consumer);
                return;
            };
            let Some(handler) = handlers.get(&job.chain_id) else {
                error!("[Scheduler] No handler for chain {}", job.chain_id);
                continue;
            };
            let outcome = worker.apply(&job, handler.as_ref()).await;
            if outcome != JobOutcome::Completed {
                debug!(
                    "[Scheduler][{}] Consumer {} finished job: {:?}",
                    job.chain_id, consumer, outcome
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncResult;
    use crate::metrics::SyncMetrics;
    use crate::worker::lock::InMemoryLock;
    use crate::worker::queue::InMemoryJobQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> SyncResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jobs_are_dispatched_per_chain() {
        let metrics = Arc::new(SyncMetrics::new_for_testing());
        let worker = Arc::new(SingletonWorker::new(
            Arc::new(InMemoryLock::new()),
            metrics,
        ));
        let mut scheduler = Scheduler::new(Arc::new(InMemoryJobQueue::new()), worker);
        let home = Arc::new(CountingHandler::default());
        let foreign = Arc::new(CountingHandler::default());
        let schedule = JobSchedule {
            interval_ms: 20,
            lock_ttl_ms: 1_000,
        };
        scheduler.register("bsc".to_string(), schedule.clone(), home.clone());
        scheduler.register("ethereum".to_string(), schedule, foreign.clone());
        assert_eq!(scheduler.chains(), vec!["bsc", "ethereum"]);

        let cancel = CancellationToken::new();
        let handles = scheduler.run(2, cancel.clone());
        // two producers, two consumers
        assert_eq!(handles.len(), 4);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(home.0.load(Ordering::SeqCst) >= 2);
        assert!(foreign.0.load(Ordering::SeqCst) >= 2);
    }
}
