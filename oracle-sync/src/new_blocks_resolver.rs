// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Discovers minted blocks by scanning home chain logs in bounded batches.
//!
//! The scan checkpoint is persisted after every batch, so a crash resumes
//! from the last completed batch. A configurable number of already scanned
//! blocks is scanned again on every pass to pick up logs that a reorg moved;
//! inserts are idempotent so the overlap is harmless.

use crate::batch_range::build_ranges;
use crate::chain_instance::ChainInstanceResolver;
use crate::error::{SyncError, SyncResult};
use crate::home_chain::HomeChain;
use crate::metrics::SyncMetrics;
use crate::types::{MintEvent, VoterEvent};
use crate::utils::format_h256;
use oracle_sync_schema::{
    last_block_checked_for_mint_event, Block, BlockStatus, ChainInstance, Fcd, MappingStore,
    OracleStore, ReplicationRecord, ReplicationRecordStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlocksResolverConfig {
    pub rescan_depth: u64,
    pub max_block_range: u64,
    pub fcd_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Inclusive scanned range, `None` when there was nothing to scan.
    pub range: Option<[u64; 2]>,
    pub mint_events: usize,
    pub inserted: usize,
}

pub struct NewBlocksResolver {
    home: Arc<dyn HomeChain>,
    store: Arc<dyn OracleStore>,
    mapping: Arc<dyn MappingStore>,
    instances: ChainInstanceResolver,
    config: NewBlocksResolverConfig,
    metrics: Arc<SyncMetrics>,
}

impl NewBlocksResolver {
    pub fn new(
        home: Arc<dyn HomeChain>,
        store: Arc<dyn OracleStore>,
        mapping: Arc<dyn MappingStore>,
        config: NewBlocksResolverConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            instances: ChainInstanceResolver::new(store.clone()),
            home,
            store,
            mapping,
            config,
            metrics,
        }
    }

    fn chain_id(&self) -> &str {
        self.home.chain_id()
    }

    pub async fn apply(&self) -> SyncResult<ScanReport> {
        let chain_id = self.chain_id().to_string();
        let checkpoint_key = last_block_checked_for_mint_event(&chain_id);
        let height = self.home.block_number().await?;

        let instances = self.store.chain_instances(&chain_id).await?;
        let Some(first_anchor) = instances.iter().map(|i| i.anchor).min() else {
            warn!("[NewBlocksResolver][{}] No chain instance registered yet", chain_id);
            return Ok(ScanReport::default());
        };

        let checkpoint = match self.mapping.get(&checkpoint_key).await? {
            Some(value) => Some(value.parse::<u64>().map_err(|e| {
                SyncError::Internal(format!("invalid checkpoint {}: {}", value, e))
            })?),
            None => None,
        };
        let from = match checkpoint {
            Some(checkpoint) => (checkpoint + 1).saturating_sub(self.config.rescan_depth),
            None => first_anchor,
        }
        .max(first_anchor);
        let Some(to) = height.checked_sub(1) else {
            return Ok(ScanReport::default());
        };
        if from > to {
            debug!(
                "[NewBlocksResolver][{}] Nothing to scan, from {} > to {}",
                chain_id, from, to
            );
            return Ok(ScanReport::default());
        }

        let ranges = if from == to {
            vec![[from, to]]
        } else {
            build_ranges(from, to, self.config.max_block_range)
        };
        let mut report = ScanReport {
            range: Some([from, to]),
            ..Default::default()
        };
        for [batch_from, batch_to] in ranges {
            let instances = self
                .instances
                .instances_in_range(&chain_id, batch_from, batch_to)
                .await?;
            for instance in instances {
                let (mints, inserted) = self.scan_instance(&instance, batch_from, batch_to).await?;
                report.mint_events += mints;
                report.inserted += inserted;
            }
            self.mapping.set(&checkpoint_key, batch_to.to_string()).await?;
            self.metrics
                .last_scanned_anchor
                .with_label_values(&[&chain_id])
                .set(batch_to as i64);
        }

        self.refresh_fcds(&chain_id, height).await?;
        if report.inserted > 0 {
            info!(
                "[NewBlocksResolver][{}] Scanned [{}, {}]: {} mint events, {} new blocks",
                chain_id, from, to, report.mint_events, report.inserted
            );
        }
        Ok(report)
    }

    /// Returns the number of mint events and of newly inserted blocks.
    async fn scan_instance(
        &self,
        instance: &ChainInstance,
        from: u64,
        to: u64,
    ) -> SyncResult<(usize, usize)> {
        let (mints, voters) = futures::try_join!(
            self.home.mint_events(&instance.address, from, to),
            self.home.voter_events(&instance.address, from, to),
        )?;
        let mut voters_by_block = group_voters(voters);
        let mut inserted = 0;
        for mint in &mints {
            let votes = voters_by_block.remove(&mint.block_id).unwrap_or_default();
            if self.ingest(mint, votes).await? {
                inserted += 1;
            }
        }
        Ok((mints.len(), inserted))
    }

    async fn ingest(&self, mint: &MintEvent, votes: Vec<VoterEvent>) -> SyncResult<bool> {
        let chain_id = self.chain_id();
        let on_chain = self
            .home
            .block(&mint.chain_address, mint.block_id)
            .await?
            .ok_or_else(|| {
                SyncError::Rpc(format!(
                    "block {} minted at {} is not stored by {}",
                    mint.block_id, mint.anchor, mint.chain_address
                ))
            })?;

        let block = Block {
            block_id: mint.block_id,
            status: BlockStatus::Completed,
            data_timestamp: on_chain.data_timestamp,
            root: format_h256(&on_chain.root),
            staked: mint.staked.to_string(),
            power: mint.power.to_string(),
            voters: votes.iter().map(|v| v.voter.clone()).collect(),
            votes: votes
                .iter()
                .map(|v| (v.voter.clone(), v.vote.to_string()))
                .collect(),
            fcd: BTreeMap::new(),
            chain_address: mint.chain_address.clone(),
            anchor: mint.anchor,
        };
        let outcome = self.store.insert_block(block).await?;
        self.store
            .insert_replication(ReplicationRecord {
                chain_id: chain_id.to_string(),
                block_id: mint.block_id,
                anchor: mint.anchor,
                chain_address: mint.chain_address.clone(),
                minter: mint.minter.clone(),
                status: ReplicationRecordStatus::Minted,
            })
            .await?;
        if outcome.is_inserted() {
            self.metrics
                .blocks_discovered
                .with_label_values(&[chain_id])
                .inc();
            info!(
                "[NewBlocksResolver][{}] New block {} at anchor {} with {} voters",
                chain_id,
                mint.block_id,
                mint.anchor,
                votes.len()
            );
        }
        Ok(outcome.is_inserted())
    }

    /// Reads FCD values from the contract that is authoritative at `height`.
    async fn refresh_fcds(&self, chain_id: &str, height: u64) -> SyncResult<()> {
        if self.config.fcd_keys.is_empty() {
            return Ok(());
        }
        let Some(Some(current)) = self
            .instances
            .resolve_by_anchor(chain_id, &[height])
            .await?
            .pop()
        else {
            return Ok(());
        };
        let values = self.home.fcds(&current.address, &self.config.fcd_keys).await?;
        for value in values {
            self.store
                .upsert_fcd(Fcd {
                    key: value.key,
                    chain_id: self.chain_id().to_string(),
                    value: value.value,
                    data_timestamp: value.data_timestamp,
                })
                .await?;
        }
        Ok(())
    }
}

/// Voter events keyed by block id, in log order.
fn group_voters(voters: Vec<VoterEvent>) -> HashMap<u64, Vec<VoterEvent>> {
    let mut grouped: HashMap<u64, Vec<VoterEvent>> = HashMap::new();
    for voter in voters {
        grouped.entry(voter.block_id).or_default().push(voter);
    }
    grouped
}
