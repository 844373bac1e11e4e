// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::ForeignChainContract;
use crate::config::{FcdKeyConfig, FcdValueType};
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::types::{BlockSubmission, ForeignChainStatus, ReplicationStatus};
use crate::utils::{encode_fixed, encode_integer, parse_h256};
use oracle_sync_schema::{Block, Fcd, OracleStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Decimals of numeric first-class-data values on every chain family.
const FCD_DECIMALS: u32 = 18;

/// A foreign chain accepts a new block once its current round is over and
/// `now` is past the last submitted data timestamp.
pub fn can_mint(status: &ForeignChainStatus, now: u64) -> bool {
    let round_end = status.last_data_timestamp.saturating_add(status.time_padding);
    now >= round_end && now > status.last_data_timestamp
}

/// Shared replication algorithm over a chain family's contract hooks.
pub struct BlockReplicator {
    contract: Arc<dyn ForeignChainContract>,
    store: Arc<dyn OracleStore>,
    home_chain_id: String,
    fcd_keys: Vec<FcdKeyConfig>,
    metrics: Arc<SyncMetrics>,
}

impl BlockReplicator {
    pub fn new(
        contract: Arc<dyn ForeignChainContract>,
        store: Arc<dyn OracleStore>,
        home_chain_id: String,
        fcd_keys: Vec<FcdKeyConfig>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            contract,
            store,
            home_chain_id,
            fcd_keys,
            metrics,
        }
    }

    fn chain_id(&self) -> &str {
        self.contract.chain_id()
    }

    pub async fn get_status(&self) -> SyncResult<ForeignChainStatus> {
        self.contract.status().await
    }

    /// At most one block: the latest finalized block past the current round.
    pub async fn resolve_pending_blocks(
        &self,
        status: &ForeignChainStatus,
        now: u64,
    ) -> SyncResult<Vec<Block>> {
        if !can_mint(status, now) {
            debug!(
                "[BlockReplicator][{}] Round in progress: last data timestamp {}, padding {}, now {}",
                self.chain_id(),
                status.last_data_timestamp,
                status.time_padding,
                now
            );
            return Ok(vec![]);
        }
        let after = status.last_data_timestamp.saturating_add(status.time_padding);
        let Some(block) = self.store.latest_finalized_block_after(after).await? else {
            return Ok(vec![]);
        };
        if block.block_id <= status.last_block_id {
            error!(
                "[BlockReplicator][{}] Block {} already replicated (last block {})",
                self.chain_id(),
                block.block_id,
                status.last_block_id
            );
            self.metrics
                .replications_skipped
                .with_label_values(&[self.chain_id(), "already_replicated"])
                .inc();
            return Ok(vec![]);
        }
        Ok(vec![block])
    }

    pub async fn replicate(
        &self,
        blocks: &[Block],
        status: &ForeignChainStatus,
    ) -> SyncResult<ReplicationStatus> {
        let block = match blocks {
            [] => return Ok(ReplicationStatus::default()),
            [block] => block,
            _ => return Err(SyncError::MultiBlockReplication(blocks.len())),
        };
        let (submission, fcds) = self.submission(block).await?;
        info!(
            "[BlockReplicator][{}] Submitting block {} ({} fcds)",
            self.chain_id(),
            block.block_id,
            submission.fcd_keys.len()
        );
        let receipt = self.contract.submit(&submission, status).await?;
        if !receipt.succeeded() {
            return Ok(ReplicationStatus::failed(format!(
                "Transaction {:?} for block {} failed with status {}",
                receipt.tx_hash, block.block_id, receipt.status
            )));
        }
        Ok(ReplicationStatus {
            blocks: vec![block.clone()],
            anchors: vec![receipt.block_number],
            fcds,
            errors: vec![],
        })
    }

    /// FCD values come from the block annotation, falling back to the latest
    /// home chain record. Keys with no value at all are left out.
    async fn submission(&self, block: &Block) -> SyncResult<(BlockSubmission, Vec<Fcd>)> {
        let missing: Vec<String> = self
            .fcd_keys
            .iter()
            .filter(|k| !block.fcd.contains_key(&k.key))
            .map(|k| k.key.clone())
            .collect();
        let stored: HashMap<String, f64> = if missing.is_empty() {
            HashMap::new()
        } else {
            self.store
                .fcds(&self.home_chain_id, &missing)
                .await?
                .into_iter()
                .map(|f| (f.key, f.value))
                .collect()
        };

        let mut submission = BlockSubmission {
            block_id: block.block_id,
            data_timestamp: block.data_timestamp,
            root: parse_h256(&block.root)?,
            fcd_keys: vec![],
            fcd_values: vec![],
        };
        let mut fcds = vec![];
        for key in &self.fcd_keys {
            let Some(value) = block
                .fcd
                .get(&key.key)
                .or_else(|| stored.get(&key.key))
                .copied()
            else {
                debug!(
                    "[BlockReplicator][{}] No value for fcd {}",
                    self.chain_id(),
                    key.key
                );
                continue;
            };
            let encoded = match key.value_type {
                FcdValueType::Numeric => encode_fixed(value, FCD_DECIMALS)?,
                FcdValueType::Integer => encode_integer(value)?,
            };
            submission.fcd_keys.push(key.key.clone());
            submission.fcd_values.push(encoded);
            fcds.push(Fcd {
                key: key.key.clone(),
                chain_id: self.chain_id().to_string(),
                value,
                data_timestamp: block.data_timestamp,
            });
        }
        Ok((submission, fcds))
    }
}
