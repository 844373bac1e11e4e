// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::SyncResult;
use crate::merkle::SortedMerkleTree;
use crate::metrics::SyncMetrics;
use crate::types::{LeafVerification, ValidatorBlockData};
use crate::utils::{decode_hex, format_h256, parse_h256};
use crate::validator_client::ValidatorClient;
use oracle_sync_schema::{Block, Fcd, Leaf, OracleStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Verifies a block's leaves against its consensus root using validator data.
pub struct LeavesSynchronizer {
    home_chain_id: String,
    store: Arc<dyn OracleStore>,
    validator_client: Arc<dyn ValidatorClient>,
    metrics: Arc<SyncMetrics>,
}

impl LeavesSynchronizer {
    pub fn new(
        home_chain_id: String,
        store: Arc<dyn OracleStore>,
        validator_client: Arc<dyn ValidatorClient>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            home_chain_id,
            store,
            validator_client,
            metrics,
        }
    }

    /// Voters are tried in order and the first matching leaf set is persisted.
    /// `locations` maps lowercase voter addresses to validator urls.
    pub async fn apply(
        &self,
        block_id: u64,
        locations: &HashMap<String, String>,
    ) -> SyncResult<LeafVerification> {
        let Some(block) = self.store.block(block_id).await? else {
            warn!("[LeavesSynchronizer] Block {} not found", block_id);
            return Ok(LeafVerification::Inconclusive);
        };
        let expected_root = parse_h256(&block.root)?;

        let mut usable_responses = 0;
        for voter in &block.voters {
            let Some(location) = locations.get(&voter.to_lowercase()) else {
                warn!(
                    "[LeavesSynchronizer] Block {}: no location for voter {}",
                    block_id, voter
                );
                continue;
            };
            let data = match self.validator_client.block_leaves(location, block_id).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    self.record("empty");
                    debug!(
                        "[LeavesSynchronizer] Block {}: {} returned no data",
                        block_id, location
                    );
                    continue;
                }
                Err(e) => {
                    self.record("error");
                    warn!(
                        "[LeavesSynchronizer] Block {}: request to {} failed: {:?}",
                        block_id, location, e
                    );
                    continue;
                }
            };

            let leaves = match decode_leaves(&data) {
                Ok(leaves) => leaves,
                Err(e) => {
                    self.record("malformed");
                    warn!(
                        "[LeavesSynchronizer] Block {}: malformed leaves from {}: {:?}",
                        block_id, location, e
                    );
                    continue;
                }
            };
            usable_responses += 1;

            let tree = SortedMerkleTree::new(&leaves);
            let root = tree.root();
            if root != expected_root {
                self.record("mismatch");
                warn!(
                    "[LeavesSynchronizer] Block {}: root from {} is {}, expected {}",
                    block_id,
                    location,
                    format_h256(&root),
                    block.root
                );
                continue;
            }

            self.record("match");
            self.persist(&block, &data, &tree).await?;
            info!(
                "[LeavesSynchronizer] Block {}: {} leaves verified via {}",
                block_id,
                data.data.len(),
                location
            );
            return Ok(LeafVerification::Verified);
        }

        if usable_responses == 0 {
            Ok(LeafVerification::Inconclusive)
        } else {
            Ok(LeafVerification::Rejected)
        }
    }

    async fn persist(
        &self,
        block: &Block,
        data: &ValidatorBlockData,
        tree: &SortedMerkleTree,
    ) -> SyncResult<()> {
        for (key, value) in &data.data {
            let proof = tree
                .proof(key)
                .unwrap_or_default()
                .iter()
                .map(format_h256)
                .collect();
            self.store
                .upsert_leaf(Leaf {
                    block_id: block.block_id,
                    key: key.clone(),
                    value: value.clone(),
                    proof,
                })
                .await?;
        }

        let keys = &data.numeric_fcd_keys;
        let values = &data.numeric_fcd_values;
        if keys.len() != values.len() {
            warn!(
                "[LeavesSynchronizer] Block {}: {} fcd keys but {} values, skipping fcd",
                block.block_id,
                keys.len(),
                values.len()
            );
            return Ok(());
        }
        if !keys.is_empty() {
            self.store
                .annotate_block_fcd(block.block_id, keys, values)
                .await?;
            for (key, value) in keys.iter().zip(values) {
                self.store
                    .upsert_fcd(Fcd {
                        key: key.clone(),
                        chain_id: self.home_chain_id.clone(),
                        value: *value,
                        data_timestamp: block.data_timestamp,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .validator_requests
            .with_label_values(&[outcome])
            .inc();
    }
}

fn decode_leaves(data: &ValidatorBlockData) -> SyncResult<BTreeMap<String, Vec<u8>>> {
    data.data
        .iter()
        .map(|(key, value)| Ok((key.clone(), decode_hex(value)?)))
        .collect()
}
