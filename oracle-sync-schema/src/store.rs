// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage seams consumed by the sync engine.

use crate::models::{
    Block, BlockStatus, ChainInstance, Fcd, Leaf, ReplicationRecord,
};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an insert keyed by a deterministic identity. A duplicate is
/// reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

#[async_trait]
pub trait OracleStore: Send + Sync {
    async fn insert_block(&self, block: Block) -> StoreResult<InsertOutcome>;

    async fn block(&self, block_id: u64) -> StoreResult<Option<Block>>;

    /// Highest stored block id regardless of status.
    async fn latest_block_id(&self) -> StoreResult<Option<u64>>;

    /// Blocks with the given status, ascending by block id.
    async fn blocks_with_status(&self, status: BlockStatus, limit: usize)
        -> StoreResult<Vec<Block>>;

    /// Most recent blocks whose status is one of `statuses`, descending by block id.
    async fn latest_blocks_with_statuses(
        &self,
        statuses: &[BlockStatus],
        limit: usize,
    ) -> StoreResult<Vec<Block>>;

    /// Most recent finalized block with `data_timestamp > after_timestamp`.
    async fn latest_finalized_block_after(&self, after_timestamp: u64)
        -> StoreResult<Option<Block>>;

    /// Applies all status updates and returns how many blocks were changed.
    async fn update_block_statuses(&self, updates: &[(u64, BlockStatus)]) -> StoreResult<usize>;

    async fn annotate_block_fcd(
        &self,
        block_id: u64,
        keys: &[String],
        values: &[f64],
    ) -> StoreResult<()>;

    /// Deletes one block together with its leaves.
    async fn delete_block(&self, block_id: u64) -> StoreResult<bool>;

    /// Deletes every block with `block_id >= from_block_id` together with
    /// their leaves. Returns the number of deleted blocks.
    async fn delete_blocks_from(&self, from_block_id: u64) -> StoreResult<u64>;

    async fn upsert_leaf(&self, leaf: Leaf) -> StoreResult<()>;

    async fn leaves(&self, block_id: u64) -> StoreResult<Vec<Leaf>>;

    async fn insert_chain_instance(&self, instance: ChainInstance) -> StoreResult<InsertOutcome>;

    async fn chain_instances(&self, chain_id: &str) -> StoreResult<Vec<ChainInstance>>;

    async fn insert_replication(&self, record: ReplicationRecord) -> StoreResult<InsertOutcome>;

    async fn replication(&self, chain_id: &str, block_id: u64)
        -> StoreResult<Option<ReplicationRecord>>;

    async fn latest_replication(&self, chain_id: &str) -> StoreResult<Option<ReplicationRecord>>;

    /// Deletes every record of `chain_id` with `block_id >= from_block_id`.
    async fn delete_replications_from(&self, chain_id: &str, from_block_id: u64)
        -> StoreResult<u64>;

    async fn upsert_fcd(&self, fcd: Fcd) -> StoreResult<()>;

    async fn fcds(&self, chain_id: &str, keys: &[String]) -> StoreResult<Vec<Fcd>>;
}

/// Plain string key/value mapping used for scan checkpoints.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StoreResult<()>;
}
