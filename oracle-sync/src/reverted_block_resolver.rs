// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::SyncResult;
use crate::metrics::SyncMetrics;
use oracle_sync_schema::OracleStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Deletes local state above a chain's next block id after a rollback.
pub struct RevertedBlockResolver {
    home_chain_id: String,
    store: Arc<dyn OracleStore>,
    metrics: Arc<SyncMetrics>,
}

impl RevertedBlockResolver {
    pub fn new(home_chain_id: String, store: Arc<dyn OracleStore>, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            home_chain_id,
            store,
            metrics,
        }
    }

    /// Returns -1 when `last_submitted_block_id <= next_block_id` (no revert).
    /// Otherwise deletes home blocks with their leaves and home chain
    /// records, or the replication records of the foreign chain `chain_id`,
    /// with `block_id >= next_block_id` and returns the number of deleted
    /// blocks or records.
    pub async fn apply(
        &self,
        last_submitted_block_id: u64,
        next_block_id: u64,
        chain_id: Option<&str>,
    ) -> SyncResult<i64> {
        if last_submitted_block_id <= next_block_id {
            return Ok(-1);
        }
        let chain_id = chain_id.unwrap_or(&self.home_chain_id);
        warn!(
            "[RevertedBlockResolver][{}] Block reverted: last submitted {}, next {}",
            chain_id, last_submitted_block_id, next_block_id
        );
        let deleted = if chain_id == self.home_chain_id {
            self.delete_home_from(next_block_id).await?
        } else {
            let deleted = self
                .store
                .delete_replications_from(chain_id, next_block_id)
                .await?;
            self.metrics
                .blocks_reverted
                .with_label_values(&[chain_id])
                .inc_by(deleted);
            deleted
        };
        warn!(
            "[RevertedBlockResolver][{}] Deleted {} records with block id >= {}",
            chain_id, deleted, next_block_id
        );
        Ok(deleted as i64)
    }

    /// Deletes home blocks from `from_block_id` on, together with their
    /// leaves and the home chain records written when they were minted.
    /// Returns the number of deleted blocks.
    pub async fn delete_home_from(&self, from_block_id: u64) -> SyncResult<u64> {
        let deleted = self.store.delete_blocks_from(from_block_id).await?;
        let records = self
            .store
            .delete_replications_from(&self.home_chain_id, from_block_id)
            .await?;
        self.metrics
            .blocks_reverted
            .with_label_values(&[&self.home_chain_id])
            .inc_by(deleted);
        info!(
            "[RevertedBlockResolver][{}] Deleted {} blocks and {} records from {}",
            self.home_chain_id, deleted, records, from_block_id
        );
        Ok(deleted)
    }
}
