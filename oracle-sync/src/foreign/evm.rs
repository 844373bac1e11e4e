// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::ForeignChainContract;
use crate::config::ValidatedForeignChain;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::rpc::ChainRpc;
use crate::tx_sender::TxSender;
use crate::types::{BlockSubmission, ForeignChainStatus, TxOverrides, TxReceipt};
use crate::utils::{format_address, key_to_bytes32, parse_address};
use async_trait::async_trait;
use ethers::abi::parse_abi;
use ethers::contract::BaseContract;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Bytes, Eip1559TransactionRequest, TransactionRequest, U256,
};
use std::sync::Arc;
use std::time::Duration;

const FOREIGN_CHAIN_ABI: &[&str] = &[
    "function getStatus() external view returns (uint256 blockNumber, uint32 timePadding, uint32 lastDataTimestamp, uint32 lastBlockId, uint32 nextBlockId)",
    "function architectureVersion() external view returns (uint32)",
    "function submit(uint32 dataTimestamp, bytes32 root, bytes32[] keys, uint256[] values, uint32 blockId) external returns (bool)",
];

/// Headroom over the node estimate, in percent.
const GAS_LIMIT_MARGIN_PERCENT: u64 = 20;

/// Contracts deployed before the marker existed.
const LEGACY_ARCHITECTURE_VERSION: u32 = 1;

/// Foreign chain contract on an EVM chain, submitting through `TxSender`.
pub struct EvmForeignChain {
    chain_id: String,
    address: EthAddress,
    contract: BaseContract,
    rpc: Arc<dyn ChainRpc>,
    tx_sender: TxSender,
    min_gas_price: u64,
    max_gas_price: u64,
    transaction_timeout: Duration,
}

impl EvmForeignChain {
    pub fn new(
        chain: &ValidatedForeignChain,
        rpc: Arc<dyn ChainRpc>,
        metrics: Arc<SyncMetrics>,
    ) -> SyncResult<Self> {
        let contract = BaseContract::from(
            parse_abi(FOREIGN_CHAIN_ABI).map_err(|e| SyncError::Internal(e.to_string()))?,
        );
        let settings = &chain.settings;
        Ok(Self {
            chain_id: chain.chain_id.clone(),
            address: parse_address(&settings.contract_address)?,
            contract,
            tx_sender: TxSender::new(
                chain.chain_id.clone(),
                rpc.clone(),
                settings.receipt_poll_interval(),
                metrics,
            ),
            rpc,
            min_gas_price: settings.min_gas_price,
            max_gas_price: settings.max_gas_price,
            transaction_timeout: settings.transaction_timeout(),
        })
    }

    async fn call(&self, data: Bytes) -> SyncResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.address)
            .data(data)
            .into();
        self.rpc.call(&tx).await
    }

    fn build_tx(&self, data: Bytes, overrides: &TxOverrides) -> TypedTransaction {
        let sender = self.rpc.sender();
        let mut tx: TypedTransaction = match overrides.max_fee_per_gas {
            Some(max_fee) => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(sender)
                    .to(self.address)
                    .data(data)
                    .max_fee_per_gas(max_fee);
                if let Some(priority) = overrides.max_priority_fee_per_gas {
                    tx = tx.max_priority_fee_per_gas(priority);
                }
                tx.into()
            }
            None => {
                let mut tx = TransactionRequest::new()
                    .from(sender)
                    .to(self.address)
                    .data(data);
                if let Some(gas_price) = overrides.gas_price {
                    tx = tx.gas_price(gas_price);
                }
                tx.into()
            }
        };
        if let Some(nonce) = overrides.nonce {
            tx.set_nonce(nonce);
        }
        if let Some(gas) = overrides.gas_limit {
            tx.set_gas(gas);
        }
        tx
    }
}

#[async_trait]
impl ForeignChainContract for EvmForeignChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn wallet_address(&self) -> String {
        format_address(&self.rpc.sender())
    }

    async fn status(&self) -> SyncResult<ForeignChainStatus> {
        let data = self.contract.encode("getStatus", ())?;
        let output = self.call(data).await?;
        let (_block_number, time_padding, last_data_timestamp, last_block_id, next_block_id): (
            U256,
            u32,
            u32,
            u32,
            u32,
        ) = self.contract.decode_output("getStatus", output)?;
        Ok(ForeignChainStatus {
            chain_address: format_address(&self.address),
            last_block_id: last_block_id as u64,
            last_data_timestamp: last_data_timestamp as u64,
            time_padding: time_padding as u64,
            next_block_id: next_block_id as u64,
        })
    }

    async fn architecture_version(&self) -> SyncResult<u32> {
        let data = self.contract.encode("architectureVersion", ())?;
        match self.call(data).await {
            Ok(output) if output.is_empty() => Ok(LEGACY_ARCHITECTURE_VERSION),
            Ok(output) => Ok(self.contract.decode_output("architectureVersion", output)?),
            Err(SyncError::Rpc(msg)) if msg.contains("revert") => {
                Ok(LEGACY_ARCHITECTURE_VERSION)
            }
            Err(e) => Err(e),
        }
    }

    async fn balance(&self) -> SyncResult<U256> {
        self.rpc.balance(self.rpc.sender()).await
    }

    async fn submit(
        &self,
        submission: &BlockSubmission,
        status: &ForeignChainStatus,
    ) -> SyncResult<TxReceipt> {
        let keys: Vec<[u8; 32]> = submission
            .fcd_keys
            .iter()
            .map(|k| key_to_bytes32(k))
            .collect();
        let values: Vec<U256> = submission
            .fcd_values
            .iter()
            .map(|v| U256::from_big_endian(v))
            .collect();
        let data = self.contract.encode(
            "submit",
            (
                submission.data_timestamp as u32,
                submission.root.0,
                keys,
                values,
                submission.block_id as u32,
            ),
        )?;
        let timeout = Duration::from_secs(status.time_padding).max(self.transaction_timeout);
        // a submission that would revert fails here without spending gas
        let estimated = self
            .rpc
            .estimate_gas(&self.build_tx(data.clone(), &TxOverrides::default()))
            .await?;
        let gas_limit = estimated + estimated * GAS_LIMIT_MARGIN_PERCENT / 100;
        let rpc = self.rpc.clone();
        self.tx_sender
            .apply(
                |overrides| {
                    let tx = self.build_tx(data.clone(), &overrides);
                    let rpc = rpc.clone();
                    async move { rpc.send_transaction(tx).await }
                },
                self.min_gas_price,
                self.max_gas_price,
                timeout,
                TxOverrides {
                    gas_limit: Some(gas_limit),
                    ..Default::default()
                },
            )
            .await
    }
}
