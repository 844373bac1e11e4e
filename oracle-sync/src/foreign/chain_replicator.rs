// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{BlockReplicator, ForeignChainContract};
use crate::config::ValidatedForeignChain;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::reverted_block_resolver::RevertedBlockResolver;
use crate::types::{ForeignChainStatus, ReplicationStatus};
use crate::utils::{now_millis, now_secs};
use async_trait::async_trait;
use ethers::types::U256;
use ethers::utils::format_units;
use oracle_sync_schema::{
    dispatcher_cooldown_until, MappingStore, OracleStore, ReplicationRecord,
    ReplicationRecordStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What to do with a chain whose contract moved to a newer dispatcher architecture.
#[async_trait]
pub trait DispatcherPolicy: Send + Sync {
    /// Whether `chain_id` must be left alone at `now_ms`.
    async fn paused(&self, chain_id: &str, now_ms: u64) -> SyncResult<bool>;

    async fn on_upgraded(&self, chain_id: &str, version: u32, now_ms: u64) -> SyncResult<()>;
}

/// Skips an upgraded chain for `cooldown`. The deadline is kept in the
/// mapping store so every worker sharing it backs off, and no consumer is
/// held while waiting.
pub struct CooldownPolicy {
    cooldown: Duration,
    mappings: Arc<dyn MappingStore>,
}

impl CooldownPolicy {
    pub fn new(cooldown: Duration, mappings: Arc<dyn MappingStore>) -> Self {
        Self { cooldown, mappings }
    }
}

#[async_trait]
impl DispatcherPolicy for CooldownPolicy {
    async fn paused(&self, chain_id: &str, now_ms: u64) -> SyncResult<bool> {
        let until = self
            .mappings
            .get(&dispatcher_cooldown_until(chain_id))
            .await?
            .and_then(|v| v.parse::<u64>().ok());
        Ok(matches!(until, Some(until) if now_ms < until))
    }

    async fn on_upgraded(&self, chain_id: &str, version: u32, now_ms: u64) -> SyncResult<()> {
        let until = now_ms.saturating_add(self.cooldown.as_millis() as u64);
        warn!(
            "[ForeignChainReplicator][{}] Dispatcher architecture v{} detected, skipping chain for {:?}",
            chain_id, version, self.cooldown
        );
        self.mappings
            .set(&dispatcher_cooldown_until(chain_id), until.to_string())
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Skipped, the chain runs the given dispatcher architecture.
    Upgraded(u32),
    /// Skipped, an earlier upgrade put the chain on hold.
    CoolingDown,
    /// Local replication records deleted after the chain rolled back.
    Reverted(u64),
    /// Nothing eligible this cycle.
    Idle,
    Replicated(Vec<u64>),
    Failed(Vec<String>),
}

pub struct ForeignChainReplicator {
    chain_id: String,
    contract: Arc<dyn ForeignChainContract>,
    replicator: BlockReplicator,
    reverted: RevertedBlockResolver,
    store: Arc<dyn OracleStore>,
    dispatcher: Arc<dyn DispatcherPolicy>,
    dispatcher_version: u32,
    balance_warning: U256,
    balance_error: U256,
    native_decimals: u32,
    metrics: Arc<SyncMetrics>,
}

impl ForeignChainReplicator {
    pub fn new(
        chain: &ValidatedForeignChain,
        contract: Arc<dyn ForeignChainContract>,
        store: Arc<dyn OracleStore>,
        home_chain_id: String,
        dispatcher: Arc<dyn DispatcherPolicy>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let replicator = BlockReplicator::new(
            contract.clone(),
            store.clone(),
            home_chain_id.clone(),
            chain.settings.fcd_keys.clone(),
            metrics.clone(),
        );
        Self {
            chain_id: chain.chain_id.clone(),
            contract,
            replicator,
            reverted: RevertedBlockResolver::new(home_chain_id, store.clone(), metrics.clone()),
            store,
            dispatcher,
            dispatcher_version: chain.settings.dispatcher_architecture_version,
            balance_warning: chain.balance_warning,
            balance_error: chain.balance_error,
            native_decimals: chain.settings.native_decimals,
            metrics,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub async fn apply(&self) -> SyncResult<ReplicationOutcome> {
        let now_ms = now_millis();
        if self.dispatcher.paused(&self.chain_id, now_ms).await? {
            self.skipped("cooldown");
            return Ok(ReplicationOutcome::CoolingDown);
        }
        let version = self.contract.architecture_version().await?;
        if version >= self.dispatcher_version {
            self.skipped("dispatcher");
            self.dispatcher
                .on_upgraded(&self.chain_id, version, now_ms)
                .await?;
            return Ok(ReplicationOutcome::Upgraded(version));
        }

        self.check_balance().await?;

        let status = self.replicator.get_status().await?;
        if let Some(latest) = self.store.latest_replication(&self.chain_id).await? {
            let deleted = self
                .reverted
                .apply(latest.block_id, status.next_block_id, Some(&self.chain_id))
                .await?;
            if deleted >= 0 {
                return Ok(ReplicationOutcome::Reverted(deleted as u64));
            }
        }

        let blocks = self
            .replicator
            .resolve_pending_blocks(&status, now_secs())
            .await?;
        if blocks.is_empty() {
            return Ok(ReplicationOutcome::Idle);
        }

        let result = match self.replicator.replicate(&blocks, &status).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics
                    .replications_failed
                    .with_label_values(&[&self.chain_id, e.error_type()])
                    .inc();
                error!(
                    "[ForeignChainReplicator][{}] Replication of block(s) {:?} failed: {:?}",
                    self.chain_id,
                    blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
                    e
                );
                return Err(e);
            }
        };
        if !result.errors.is_empty() {
            self.metrics
                .replications_failed
                .with_label_values(&[&self.chain_id, "receipt"])
                .inc();
            error!(
                "[ForeignChainReplicator][{}] {}",
                self.chain_id,
                result.errors.join("; ")
            );
            return Ok(ReplicationOutcome::Failed(result.errors));
        }
        Ok(self.persist(result, &status).await)
    }

    async fn check_balance(&self) -> SyncResult<()> {
        let balance = self.contract.balance().await?;
        let gwei = balance / U256::exp10(9);
        self.metrics
            .wallet_balance
            .with_label_values(&[&self.chain_id])
            .set(gwei.min(U256::from(i64::MAX as u64)).as_u64() as i64);
        if balance < self.balance_error {
            return Err(SyncError::InsufficientBalance {
                chain_id: self.chain_id.clone(),
                balance: self.display(balance),
                threshold: self.display(self.balance_error),
            });
        }
        if balance < self.balance_warning {
            warn!(
                "[ForeignChainReplicator][{}] Wallet {} balance {} is below {}",
                self.chain_id,
                self.contract.wallet_address(),
                self.display(balance),
                self.display(self.balance_warning)
            );
        }
        Ok(())
    }

    /// Saves what the chain accepted. A failed write is logged and the rest
    /// is still attempted; the next cycle re-derives anything missing.
    async fn persist(
        &self,
        result: ReplicationStatus,
        status: &ForeignChainStatus,
    ) -> ReplicationOutcome {
        let minter = self.contract.wallet_address();
        let mut replicated = vec![];
        let mut errors = vec![];
        for (block, anchor) in result.blocks.iter().zip(&result.anchors) {
            self.metrics
                .replications_ok
                .with_label_values(&[&self.chain_id])
                .inc();
            replicated.push(block.block_id);
            let record = ReplicationRecord {
                chain_id: self.chain_id.clone(),
                block_id: block.block_id,
                anchor: *anchor,
                chain_address: status.chain_address.clone(),
                minter: minter.clone(),
                status: ReplicationRecordStatus::Replicated,
            };
            match self.store.insert_replication(record).await {
                Ok(_) => info!(
                    "[ForeignChainReplicator][{}] Block {} replicated at {}",
                    self.chain_id, block.block_id, anchor
                ),
                Err(e) => {
                    error!(
                        "[ForeignChainReplicator][{}] Block {} replicated but not saved: {:?}",
                        self.chain_id, block.block_id, e
                    );
                    errors.push(e.to_string());
                }
            }
        }
        for fcd in result.fcds {
            let key = fcd.key.clone();
            if let Err(e) = self.store.upsert_fcd(fcd).await {
                error!(
                    "[ForeignChainReplicator][{}] Fcd {} not saved: {:?}",
                    self.chain_id, key, e
                );
                errors.push(e.to_string());
            }
        }
        if !errors.is_empty() {
            warn!(
                "[ForeignChainReplicator][{}] Partially saved replication of {:?}: {} errors",
                self.chain_id,
                replicated,
                errors.len()
            );
        }
        ReplicationOutcome::Replicated(replicated)
    }

    fn display(&self, amount: U256) -> String {
        format_units(amount, self.native_decimals).unwrap_or_else(|_| amount.to_string())
    }

    fn skipped(&self, reason: &str) {
        self.metrics
            .replications_skipped
            .with_label_values(&[&self.chain_id, reason])
            .inc();
    }
}
