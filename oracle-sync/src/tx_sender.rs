// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction submission with fee estimation, receipt timeout and nonce recovery.
//!
//! Waiting is poll based. Providers behind RPC proxies are not assumed to
//! support subscriptions.

use crate::error::{SyncError, SyncResult};
use crate::gas_estimator::{GasEstimate, GasEstimator};
use crate::metrics::SyncMetrics;
use crate::rpc::ChainRpc;
use crate::types::{TxOverrides, TxReceipt};
use ethers::types::{TransactionRequest, H256, U256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CANCELLATION_GAS_LIMIT: u64 = 21_000;

pub struct TxSender {
    chain_id: String,
    rpc: Arc<dyn ChainRpc>,
    gas_estimator: GasEstimator,
    poll_interval: Duration,
    metrics: Arc<SyncMetrics>,
}

impl TxSender {
    pub fn new(
        chain_id: String,
        rpc: Arc<dyn ChainRpc>,
        poll_interval: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            gas_estimator: GasEstimator::new(chain_id.clone(), rpc.clone()),
            chain_id,
            rpc,
            poll_interval,
            metrics,
        }
    }

    /// Submits the transaction built by `tx_fn` and waits for its receipt.
    ///
    /// `tx_fn` receives the fee and nonce fields to use and returns the hash
    /// of the sent transaction. Explicit `overrides` win over estimated fees.
    /// Without a receipt after `timeout` the transaction is replaced by a
    /// zero value self transfer and `TxTimeout` is returned whatever the
    /// cancellation outcome, so the original may still land.
    pub async fn apply<F, Fut>(
        &self,
        tx_fn: F,
        min_gas_price: u64,
        max_gas_price: u64,
        timeout: Duration,
        overrides: TxOverrides,
    ) -> SyncResult<TxReceipt>
    where
        F: Fn(TxOverrides) -> Fut + Send + Sync,
        Fut: Future<Output = SyncResult<H256>> + Send,
    {
        let estimate = self.gas_estimator.apply(min_gas_price, max_gas_price).await?;
        let overrides = merge_overrides(estimate.overrides(), overrides);
        let submitted_at = self.rpc.block_number().await?;

        let tx_hash = match tx_fn(overrides.clone()).await {
            Ok(hash) => hash,
            Err(SyncError::NonceConflict(msg)) => {
                let nonce = self.rpc.transaction_count(self.rpc.sender()).await?;
                warn!(
                    "[TxSender][{}] Nonce conflict ({}), retrying with nonce {}",
                    self.chain_id, msg, nonce
                );
                self.metrics
                    .nonce_retries
                    .with_label_values(&[&self.chain_id])
                    .inc();
                tx_fn(TxOverrides {
                    nonce: Some(nonce),
                    ..overrides
                })
                .await?
            }
            Err(e) => return Err(e),
        };
        info!(
            "[TxSender][{}] Submitted {:?} at block {}",
            self.chain_id, tx_hash, submitted_at
        );

        let wait = async {
            self.wait_for_next_block(submitted_at).await?;
            self.wait_for_receipt(tx_hash).await
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics
                    .tx_timeouts
                    .with_label_values(&[&self.chain_id])
                    .inc();
                warn!(
                    "[TxSender][{}] No receipt for {:?} after {:?}, cancelling",
                    self.chain_id, tx_hash, timeout
                );
                if let Err(e) = self.cancel_pending(&estimate).await {
                    error!(
                        "[TxSender][{}] Cancellation of {:?} failed: {:?}",
                        self.chain_id, tx_hash, e
                    );
                }
                Err(SyncError::TxTimeout {
                    tx_hash: format!("{:?}", tx_hash),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn wait_for_next_block(&self, submitted_at: u64) -> SyncResult<u64> {
        loop {
            let current = self.rpc.block_number().await?;
            if current > submitted_at {
                return Ok(current);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> SyncResult<TxReceipt> {
        loop {
            if let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Replaces the pending transaction with a zero value self transfer.
    async fn cancel_pending(&self, estimate: &GasEstimate) -> SyncResult<H256> {
        let sender = self.rpc.sender();
        let nonce = self.rpc.transaction_count(sender).await?;
        let gas_price = estimate.cancellation_gas_price();
        let tx = TransactionRequest::new()
            .from(sender)
            .to(sender)
            .value(U256::zero())
            .nonce(nonce)
            .gas(CANCELLATION_GAS_LIMIT)
            .gas_price(gas_price);
        let hash = self.rpc.send_transaction(tx.into()).await?;
        info!(
            "[TxSender][{}] Sent cancellation {:?} with nonce {} at gas price {}",
            self.chain_id, hash, nonce, gas_price
        );
        Ok(hash)
    }
}

fn merge_overrides(estimated: TxOverrides, explicit: TxOverrides) -> TxOverrides {
    TxOverrides {
        gas_limit: explicit.gas_limit.or(estimated.gas_limit),
        gas_price: explicit.gas_price.or(estimated.gas_price),
        max_fee_per_gas: explicit.max_fee_per_gas.or(estimated.max_fee_per_gas),
        max_priority_fee_per_gas: explicit
            .max_priority_fee_per_gas
            .or(estimated.max_priority_fee_per_gas),
        nonce: explicit.nonce.or(estimated.nonce),
    }
}
