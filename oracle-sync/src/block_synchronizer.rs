// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Drives blocks through `Completed -> Finalized | Failed`.
//!
//! Each cycle first compares the home chain's next block id with the local
//! state and stops after a revert. Recently decided blocks are then checked
//! against the on-chain root again; a mismatch deletes everything from that
//! block on and ends the cycle before any leaf verification starts.

use crate::config::BlockSynchronizerSettings;
use crate::error::{SyncError, SyncResult};
use crate::home_chain::HomeChain;
use crate::leaves_synchronizer::LeavesSynchronizer;
use crate::metrics::SyncMetrics;
use crate::reverted_block_resolver::RevertedBlockResolver;
use crate::retry_with_max_elapsed_time;
use crate::types::LeafVerification;
use crate::utils::{format_h256, parse_h256};
use futures::future::join_all;
use oracle_sync_schema::{Block, BlockStatus, OracleStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records deleted because the home chain reverted.
    pub reverted: Option<u64>,
    /// Block whose re-verification failed; it and all later blocks were deleted.
    pub halted_at: Option<u64>,
    pub corrupted: usize,
    pub finalized: usize,
    pub failed: usize,
    pub inconclusive: usize,
    pub errors: usize,
}

impl SyncReport {
    /// True when the cycle stopped early and nothing else may run in it.
    pub fn aborted(&self) -> bool {
        self.reverted.is_some() || self.halted_at.is_some()
    }
}

pub struct BlockSynchronizer {
    home: Arc<dyn HomeChain>,
    store: Arc<dyn OracleStore>,
    leaves: LeavesSynchronizer,
    reverted: RevertedBlockResolver,
    settings: BlockSynchronizerSettings,
    max_retry: Duration,
    metrics: Arc<SyncMetrics>,
}

impl BlockSynchronizer {
    pub fn new(
        home: Arc<dyn HomeChain>,
        store: Arc<dyn OracleStore>,
        leaves: LeavesSynchronizer,
        settings: BlockSynchronizerSettings,
        max_retry: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let reverted =
            RevertedBlockResolver::new(home.chain_id().to_string(), store.clone(), metrics.clone());
        Self {
            home,
            store,
            leaves,
            reverted,
            settings,
            max_retry,
            metrics,
        }
    }

    pub async fn apply(&self) -> SyncResult<SyncReport> {
        let chain_id = self.home.chain_id().to_string();
        let mut report = SyncReport::default();

        let (status, last_saved) = futures::try_join!(
            async { retry_with_max_elapsed_time!(self.home.status(), self.max_retry) },
            async { self.store.latest_block_id().await.map_err(SyncError::from) },
        )?;
        if let Some(last_saved) = last_saved {
            let deleted = self
                .reverted
                .apply(last_saved, status.next_block_id, None)
                .await?;
            if deleted >= 0 {
                warn!(
                    "[BlockSynchronizer][{}] {}",
                    chain_id,
                    SyncError::ChainReverted {
                        chain_id: chain_id.clone(),
                        last_block_id: last_saved,
                        next_block_id: status.next_block_id,
                    }
                );
                report.reverted = Some(deleted as u64);
                return Ok(report);
            }
        }

        let completed = self
            .store
            .blocks_with_status(BlockStatus::Completed, self.settings.completed_batch_size)
            .await?;
        let decided = self
            .store
            .latest_blocks_with_statuses(
                &[BlockStatus::Finalized, BlockStatus::Failed],
                self.settings.reverification_window,
            )
            .await?;
        let completed = self.discard_corrupted(completed, &mut report).await?;
        let mut decided = self.discard_corrupted(decided, &mut report).await?;

        decided.sort_by_key(|b| b.block_id);
        for block in &decided {
            match self.reverify(block).await {
                Ok(()) => {}
                Err(e @ SyncError::RootMismatch { .. }) => {
                    error!(
                        "[BlockSynchronizer][{}] Re-verification of block {} failed: {}",
                        chain_id, block.block_id, e
                    );
                    let deleted = self.reverted.delete_home_from(block.block_id).await?;
                    warn!(
                        "[BlockSynchronizer][{}] Deleted {} blocks from {}",
                        chain_id, deleted, block.block_id
                    );
                    report.halted_at = Some(block.block_id);
                    return Ok(report);
                }
                // nothing is deleted unless the chain disagrees
                Err(e) => {
                    warn!(
                        "[BlockSynchronizer][{}] Could not re-verify block {}: {}",
                        chain_id, block.block_id, e
                    );
                    return Err(e);
                }
            }
        }

        if completed.is_empty() {
            return Ok(report);
        }
        let locations = status.locations();
        let outcomes = join_all(
            completed
                .iter()
                .map(|block| self.leaves.apply(block.block_id, &locations)),
        )
        .await;

        let mut updates = vec![];
        for (block, outcome) in completed.iter().zip(outcomes) {
            match outcome {
                Ok(LeafVerification::Verified) => {
                    updates.push((block.block_id, BlockStatus::Finalized));
                    report.finalized += 1;
                }
                Ok(LeafVerification::Rejected) => {
                    updates.push((block.block_id, BlockStatus::Failed));
                    report.failed += 1;
                }
                Ok(LeafVerification::Inconclusive) => report.inconclusive += 1,
                Err(e) => {
                    error!(
                        "[BlockSynchronizer][{}] Leaf verification of block {} errored: {:?}",
                        chain_id, block.block_id, e
                    );
                    report.errors += 1;
                }
            }
        }
        if !updates.is_empty() {
            self.store.update_block_statuses(&updates).await?;
        }
        self.metrics
            .blocks_finalized
            .with_label_values(&[&chain_id])
            .inc_by(report.finalized as u64);
        self.metrics
            .blocks_failed
            .with_label_values(&[&chain_id])
            .inc_by(report.failed as u64);
        info!(
            "[BlockSynchronizer][{}] {} blocks: {} finalized, {} failed, {} inconclusive, {} errors",
            chain_id,
            completed.len(),
            report.finalized,
            report.failed,
            report.inconclusive,
            report.errors
        );
        Ok(report)
    }

    async fn discard_corrupted(
        &self,
        blocks: Vec<Block>,
        report: &mut SyncReport,
    ) -> SyncResult<Vec<Block>> {
        let mut valid = Vec::with_capacity(blocks.len());
        for block in blocks {
            let fields = block.missing_required_fields();
            if fields.is_empty() {
                valid.push(block);
                continue;
            }
            let chain_id = self.home.chain_id();
            warn!(
                "[BlockSynchronizer][{}] {}, deleting",
                chain_id,
                SyncError::CorruptedBlock {
                    block_id: block.block_id,
                    fields,
                }
            );
            self.store.delete_block(block.block_id).await?;
            self.metrics
                .blocks_corrupted
                .with_label_values(&[chain_id])
                .inc();
            report.corrupted += 1;
        }
        Ok(valid)
    }

    async fn reverify(&self, block: &Block) -> SyncResult<()> {
        let expected = parse_h256(&block.root)?;
        let on_chain = self
            .home
            .block(&block.chain_address, block.block_id)
            .await?;
        match on_chain {
            Some(on_chain) if on_chain.root == expected => Ok(()),
            Some(on_chain) => Err(SyncError::RootMismatch {
                block_id: block.block_id,
                expected: block.root.clone(),
                actual: format_h256(&on_chain.root),
            }),
            None => Err(SyncError::RootMismatch {
                block_id: block.block_id,
                expected: block.root.clone(),
                actual: "none".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        completed_block, finalized_block, init_test_logging, replication, validator_data,
        FakeHomeChain, FakeValidatorClient, TEST_CHAIN_ADDRESS,
    };
    use crate::types::{HomeChainStatus, OnChainBlock, Validator};
    use ethers::types::{H256, U256};
    use oracle_sync_schema::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        home: FakeHomeChain,
        client: FakeValidatorClient,
        synchronizer: BlockSynchronizer,
    }

    fn home_status(next_block_id: u64) -> HomeChainStatus {
        HomeChainStatus {
            block_number: 1_000,
            chain_address: TEST_CHAIN_ADDRESS.to_string(),
            next_block_id,
            last_block_id: next_block_id.saturating_sub(1),
            last_data_timestamp: 5_000,
            time_padding: 60,
            validators: vec![Validator {
                id: "0xv1".to_string(),
                location: "http://v1".to_string(),
                power: U256::from(1),
            }],
        }
    }

    fn fixture(next_block_id: u64) -> Fixture {
        init_test_logging();
        let store = Arc::new(InMemoryStore::new());
        let home = FakeHomeChain::new("bsc");
        home.set_status(home_status(next_block_id));
        let client = FakeValidatorClient::default();
        let metrics = Arc::new(SyncMetrics::new_for_testing());
        let leaves = LeavesSynchronizer::new(
            "bsc".into(),
            store.clone(),
            Arc::new(client.clone()),
            metrics.clone(),
        );
        let synchronizer = BlockSynchronizer::new(
            Arc::new(home.clone()),
            store.clone(),
            leaves,
            BlockSynchronizerSettings::default(),
            Duration::from_secs(1),
            metrics,
        );
        Fixture {
            store,
            home,
            client,
            synchronizer,
        }
    }

    /// Stores a completed block whose root commits to `values` and makes the
    /// validator serve either the same or forged data.
    async fn completed_with_leaves(f: &Fixture, block_id: u64, honest: bool) {
        let values = [("ETH-USD", 1_800)];
        let (data, root) = validator_data(&values);
        let mut block = completed_block(block_id, 1_000 + block_id);
        block.root = format_h256(&root);
        f.store.insert_block(block).await.unwrap();
        let served = if honest {
            data
        } else {
            validator_data(&[("ETH-USD", 1)]).0
        };
        f.client.respond("http://v1", block_id, Ok(Some(served)));
    }

    fn on_chain(f: &Fixture, block: &Block) {
        f.home.set_block(
            &block.chain_address,
            OnChainBlock {
                block_id: block.block_id,
                root: parse_h256(&block.root).unwrap(),
                data_timestamp: block.data_timestamp,
            },
        );
    }

    #[tokio::test]
    async fn test_completed_blocks_are_decided() {
        let f = fixture(10);
        completed_with_leaves(&f, 1, true).await;
        completed_with_leaves(&f, 2, false).await;
        // no validator answer
        f.store.insert_block(completed_block(3, 1_003)).await.unwrap();

        let report = f.synchronizer.apply().await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.inconclusive, 1);
        let status = |id| {
            let store = f.store.clone();
            async move { store.block(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(1).await, BlockStatus::Finalized);
        assert_eq!(status(2).await, BlockStatus::Failed);
        assert_eq!(status(3).await, BlockStatus::Completed);
        assert_eq!(f.store.leaves(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_aborts_cycle_before_verification() {
        let f = fixture(5);
        for id in 1..=10 {
            f.store.insert_block(finalized_block(id, id * 100)).await.unwrap();
        }
        completed_with_leaves(&f, 11, true).await;

        let report = f.synchronizer.apply().await.unwrap();
        assert_eq!(report.reverted, Some(7));
        assert!(report.aborted());
        assert_eq!(f.store.block_ids().await, vec![1, 2, 3, 4]);
        assert!(f.client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_root_mismatch_on_reverification_deletes_tail() {
        let f = fixture(20);
        for id in 1..=4 {
            let block = finalized_block(id, id * 100);
            if id != 3 {
                on_chain(&f, &block);
            }
            f.store.insert_block(block).await.unwrap();
        }
        f.home.set_block(
            TEST_CHAIN_ADDRESS,
            OnChainBlock {
                block_id: 3,
                root: H256::repeat_byte(0xee),
                data_timestamp: 300,
            },
        );
        completed_with_leaves(&f, 5, true).await;

        for id in 1..=4 {
            f.store.insert_replication(replication("bsc", id)).await.unwrap();
        }

        let report = f.synchronizer.apply().await.unwrap();
        assert_eq!(report.halted_at, Some(3));
        assert_eq!(f.store.block_ids().await, vec![1, 2]);
        assert_eq!(f.store.replication_block_ids("bsc").await, vec![1, 2]);
        assert!(f.client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failure_during_reverification_keeps_blocks() {
        let f = fixture(20);
        for id in 1..=5 {
            let block = finalized_block(id, id * 100);
            on_chain(&f, &block);
            f.store.insert_block(block).await.unwrap();
            f.store.insert_replication(replication("bsc", id)).await.unwrap();
        }
        f.home.fail_block_reads(true);

        let err = f.synchronizer.apply().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.store.block_ids().await, vec![1, 2, 3, 4, 5]);
        assert_eq!(f.store.replication_block_ids("bsc").await, vec![1, 2, 3, 4, 5]);

        // next cycle succeeds once the provider recovers
        f.home.fail_block_reads(false);
        let report = f.synchronizer.apply().await.unwrap();
        assert!(!report.aborted());
        assert_eq!(f.store.block_ids().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_corrupted_blocks_are_deleted() {
        let f = fixture(10);
        let mut broken = completed_block(1, 1_001);
        broken.voters.clear();
        f.store.insert_block(broken).await.unwrap();
        completed_with_leaves(&f, 2, true).await;

        let report = f.synchronizer.apply().await.unwrap();
        assert_eq!(report.corrupted, 1);
        assert_eq!(report.finalized, 1);
        assert_eq!(f.store.block_ids().await, vec![2]);
    }

    #[tokio::test]
    async fn test_decided_blocks_matching_chain_are_kept() {
        let f = fixture(10);
        for id in 1..=3 {
            let block = finalized_block(id, id * 100);
            on_chain(&f, &block);
            f.store.insert_block(block).await.unwrap();
        }
        let report = f.synchronizer.apply().await.unwrap();
        assert!(!report.aborted());
        assert_eq!(f.store.block_ids().await, vec![1, 2, 3]);
    }
}
