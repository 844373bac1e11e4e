// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store backing tests and single-process deployments.

use crate::models::{
    Block, BlockStatus, ChainInstance, Fcd, Leaf, ReplicationRecord,
};
use crate::store::{InsertOutcome, MappingStore, OracleStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Collections {
    blocks: BTreeMap<u64, Block>,
    leaves: BTreeMap<(u64, String), Leaf>,
    chain_instances: BTreeMap<String, ChainInstance>,
    /// Keyed by (chain id, block id).
    replications: BTreeMap<(String, u64), ReplicationRecord>,
    fcds: BTreeMap<(String, String), Fcd>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
    mappings: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block_ids(&self) -> Vec<u64> {
        self.inner.read().await.blocks.keys().copied().collect()
    }

    pub async fn replication_block_ids(&self, chain_id: &str) -> Vec<u64> {
        self.inner
            .read()
            .await
            .replications
            .keys()
            .filter(|(c, _)| c == chain_id)
            .map(|(_, b)| *b)
            .collect()
    }
}

#[async_trait]
impl OracleStore for InMemoryStore {
    async fn insert_block(&self, block: Block) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.write().await;
        if inner.blocks.contains_key(&block.block_id) {
            debug!("[InMemoryStore] Block {} already exists", block.block_id);
            return Ok(InsertOutcome::AlreadyExists);
        }
        inner.blocks.insert(block.block_id, block);
        Ok(InsertOutcome::Inserted)
    }

    async fn block(&self, block_id: u64) -> StoreResult<Option<Block>> {
        Ok(self.inner.read().await.blocks.get(&block_id).cloned())
    }

    async fn latest_block_id(&self) -> StoreResult<Option<u64>> {
        Ok(self.inner.read().await.blocks.keys().next_back().copied())
    }

    async fn blocks_with_status(
        &self,
        status: BlockStatus,
        limit: usize,
    ) -> StoreResult<Vec<Block>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .values()
            .filter(|b| b.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_blocks_with_statuses(
        &self,
        statuses: &[BlockStatus],
        limit: usize,
    ) -> StoreResult<Vec<Block>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .values()
            .rev()
            .filter(|b| statuses.contains(&b.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_finalized_block_after(
        &self,
        after_timestamp: u64,
    ) -> StoreResult<Option<Block>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .values()
            .rev()
            .find(|b| b.status == BlockStatus::Finalized && b.data_timestamp > after_timestamp)
            .cloned())
    }

    async fn update_block_statuses(&self, updates: &[(u64, BlockStatus)]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for (block_id, status) in updates {
            if let Some(block) = inner.blocks.get_mut(block_id) {
                block.status = *status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn annotate_block_fcd(
        &self,
        block_id: u64,
        keys: &[String],
        values: &[f64],
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let block = inner
            .blocks
            .get_mut(&block_id)
            .ok_or_else(|| StoreError::NotFound(crate::models::block_key(block_id)))?;
        for (key, value) in keys.iter().zip(values) {
            block.fcd.insert(key.clone(), *value);
        }
        Ok(())
    }

    async fn delete_block(&self, block_id: u64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        inner.leaves.retain(|(b, _), _| *b != block_id);
        Ok(inner.blocks.remove(&block_id).is_some())
    }

    async fn delete_blocks_from(&self, from_block_id: u64) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let removed = inner.blocks.split_off(&from_block_id);
        inner.leaves.retain(|(b, _), _| *b < from_block_id);
        Ok(removed.len() as u64)
    }

    async fn upsert_leaf(&self, leaf: Leaf) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.leaves.insert((leaf.block_id, leaf.key.clone()), leaf);
        Ok(())
    }

    async fn leaves(&self, block_id: u64) -> StoreResult<Vec<Leaf>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leaves
            .values()
            .filter(|l| l.block_id == block_id)
            .cloned()
            .collect())
    }

    async fn insert_chain_instance(&self, instance: ChainInstance) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.write().await;
        let id = instance.id();
        if inner.chain_instances.contains_key(&id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        inner.chain_instances.insert(id, instance);
        Ok(InsertOutcome::Inserted)
    }

    async fn chain_instances(&self, chain_id: &str) -> StoreResult<Vec<ChainInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chain_instances
            .values()
            .filter(|c| c.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn insert_replication(&self, record: ReplicationRecord) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.write().await;
        let key = (record.chain_id.clone(), record.block_id);
        if inner.replications.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        inner.replications.insert(key, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn replication(
        &self,
        chain_id: &str,
        block_id: u64,
    ) -> StoreResult<Option<ReplicationRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .replications
            .get(&(chain_id.to_string(), block_id))
            .cloned())
    }

    async fn latest_replication(&self, chain_id: &str) -> StoreResult<Option<ReplicationRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .replications
            .values()
            .filter(|r| r.chain_id == chain_id)
            .max_by_key(|r| r.block_id)
            .cloned())
    }

    async fn delete_replications_from(
        &self,
        chain_id: &str,
        from_block_id: u64,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.replications.len();
        inner
            .replications
            .retain(|(c, b), _| !(c == chain_id && *b >= from_block_id));
        Ok((before - inner.replications.len()) as u64)
    }

    async fn upsert_fcd(&self, fcd: Fcd) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .fcds
            .insert((fcd.chain_id.clone(), fcd.key.clone()), fcd);
        Ok(())
    }

    async fn fcds(&self, chain_id: &str, keys: &[String]) -> StoreResult<Vec<Fcd>> {
        let inner = self.inner.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| inner.fcds.get(&(chain_id.to_string(), k.clone())).cloned())
            .collect())
    }
}

#[async_trait]
impl MappingStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.mappings.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.mappings.write().await.insert(key.to_string(), value);
        Ok(())
    }
}
