// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use oracle_sync_schema::ChainId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// One scheduled unit of work for a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub chain_id: ChainId,
    pub lock_ttl_ms: u64,
    pub interval_ms: u64,
    pub enqueued_at_ms: u64,
}

impl Job {
    /// A job older than its interval was overtaken by a newer one.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.enqueued_at_ms) > self.interval_ms
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> SyncResult<()>;

    /// Next job, `None` once the queue is closed.
    async fn next(&self) -> Option<Job>;
}

pub struct InMemoryJobQueue {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> SyncResult<()> {
        self.sender
            .send(job)
            .map_err(|e| SyncError::Internal(format!("job queue closed: {}", e)))
    }

    async fn next(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }
}
