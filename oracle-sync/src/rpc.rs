// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The slice of chain RPC used for fee estimation and transaction submission.

use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::types::TxReceipt;
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, BlockId, BlockNumber, Bytes, H256, U256};
use std::sync::Arc;
use tap::TapFallible;

/// Gas prices paid by the transactions of the latest block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestBlockFees {
    pub gas_prices: Vec<u64>,
    /// Present on fee market (type 2) chains.
    pub base_fee_per_gas: Option<u64>,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Account that signs and pays for submitted transactions.
    fn sender(&self) -> EthAddress;

    async fn block_number(&self) -> SyncResult<u64>;

    async fn latest_block_fees(&self) -> SyncResult<LatestBlockFees>;

    async fn gas_price(&self) -> SyncResult<u64>;

    async fn max_priority_fee_per_gas(&self) -> SyncResult<u64>;

    /// Read-only contract call at the latest block.
    async fn call(&self, tx: &TypedTransaction) -> SyncResult<Bytes>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> SyncResult<U256>;

    async fn transaction_receipt(&self, tx_hash: H256) -> SyncResult<Option<TxReceipt>>;

    /// Number of confirmed transactions sent by `address`, i.e. the next free nonce.
    async fn transaction_count(&self, address: EthAddress) -> SyncResult<U256>;

    async fn balance(&self, address: EthAddress) -> SyncResult<U256>;

    async fn send_transaction(&self, tx: TypedTransaction) -> SyncResult<H256>;
}

/// Maps a submission error to `NonceConflict` when the node rejected the nonce.
pub fn classify_send_error(message: String) -> SyncError {
    let lower = message.to_lowercase();
    let nonce_conflict = [
        "nonce too low",
        "nonce has already been used",
        "already known",
        "replacement transaction underpriced",
        "nonce is too low",
    ]
    .iter()
    .any(|pattern| lower.contains(pattern));
    if nonce_conflict {
        SyncError::NonceConflict(message)
    } else {
        SyncError::Rpc(message)
    }
}

fn u256_to_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

/// `ChainRpc` over any ethers middleware, usually a signer middleware.
pub struct MiddlewareRpc<M> {
    chain_id: String,
    middleware: Arc<M>,
    sender: EthAddress,
    metrics: Arc<SyncMetrics>,
}

impl<M: Middleware + 'static> MiddlewareRpc<M> {
    pub fn new(
        chain_id: String,
        middleware: Arc<M>,
        sender: EthAddress,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            chain_id,
            middleware,
            sender,
            metrics,
        }
    }

    fn record(&self, method: &str) {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_id, method])
            .inc();
    }

    fn rpc_error(&self, method: &str, e: impl std::fmt::Display) -> SyncError {
        self.metrics
            .rpc_errors
            .with_label_values(&[&self.chain_id, method])
            .inc();
        SyncError::Rpc(format!("{}: {}", method, e))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainRpc for MiddlewareRpc<M> {
    fn sender(&self) -> EthAddress {
        self.sender
    }

    async fn block_number(&self) -> SyncResult<u64> {
        self.record("block_number");
        self.middleware
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.rpc_error("block_number", e))
    }

    async fn latest_block_fees(&self) -> SyncResult<LatestBlockFees> {
        self.record("get_block_with_txs");
        let block = self
            .middleware
            .get_block_with_txs(BlockId::Number(BlockNumber::Latest))
            .await
            .map_err(|e| self.rpc_error("get_block_with_txs", e))?
            .ok_or_else(|| SyncError::Rpc("latest block not found".into()))?;
        Ok(LatestBlockFees {
            gas_prices: block
                .transactions
                .iter()
                .filter_map(|tx| tx.gas_price)
                .map(u256_to_u64)
                .collect(),
            base_fee_per_gas: block.base_fee_per_gas.map(u256_to_u64),
        })
    }

    async fn gas_price(&self) -> SyncResult<u64> {
        self.record("gas_price");
        self.middleware
            .get_gas_price()
            .await
            .map(u256_to_u64)
            .map_err(|e| self.rpc_error("gas_price", e))
    }

    async fn max_priority_fee_per_gas(&self) -> SyncResult<u64> {
        self.record("max_priority_fee_per_gas");
        self.middleware
            .provider()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map(u256_to_u64)
            .map_err(|e| self.rpc_error("max_priority_fee_per_gas", e))
    }

    async fn call(&self, tx: &TypedTransaction) -> SyncResult<Bytes> {
        self.record("call");
        self.middleware
            .call(tx, None)
            .await
            .map_err(|e| self.rpc_error("call", e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> SyncResult<U256> {
        self.record("estimate_gas");
        self.middleware
            .estimate_gas(tx, None)
            .await
            .map_err(|e| classify_send_error(e.to_string()))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> SyncResult<Option<TxReceipt>> {
        self.record("get_transaction_receipt");
        let receipt = self
            .middleware
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.rpc_error("get_transaction_receipt", e))?;
        Ok(receipt.and_then(|r| {
            // pending receipts carry no block yet
            let block_number = r.block_number?.as_u64();
            Some(TxReceipt {
                tx_hash: r.transaction_hash,
                block_number,
                status: r.status.map(|s| s.as_u64()).unwrap_or_default(),
            })
        }))
    }

    async fn transaction_count(&self, address: EthAddress) -> SyncResult<U256> {
        self.record("get_transaction_count");
        self.middleware
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Latest)))
            .await
            .map_err(|e| self.rpc_error("get_transaction_count", e))
    }

    async fn balance(&self, address: EthAddress) -> SyncResult<U256> {
        self.record("get_balance");
        self.middleware
            .get_balance(address, None)
            .await
            .map_err(|e| self.rpc_error("get_balance", e))
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> SyncResult<H256> {
        self.record("send_transaction");
        let pending = self
            .middleware
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify_send_error(e.to_string()))
            .tap_err(|e| {
                self.metrics
                    .rpc_errors
                    .with_label_values(&[&self.chain_id, "send_transaction"])
                    .inc();
                tracing::warn!("[ChainRpc][{}] send_transaction failed: {:?}", self.chain_id, e)
            })?;
        Ok(pending.tx_hash())
    }
}
