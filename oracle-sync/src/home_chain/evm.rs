// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{FcdValue, HomeChain};
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::types::{HomeChainStatus, MintEvent, OnChainBlock, Validator, VoterEvent};
use crate::utils::{checked_u64, format_address, key_to_bytes32, parse_address, u256_to_f64};
use async_trait::async_trait;
use ethers::abi::parse_abi;
use ethers::contract::BaseContract;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, Filter, Log, TransactionRequest, H256, U256};
use std::sync::Arc;
use tap::TapFallible;

const REGISTRY_ABI: &[&str] =
    &["function getAddressByString(string name) external view returns (address)"];

const CHAIN_ABI: &[&str] = &[
    "function getStatus() external view returns (uint256 blockNumber, uint256 timePadding, uint256 lastDataTimestamp, uint256 lastBlockId, address nextLeader, uint256 nextBlockId, address[] validators, uint256[] powers, string[] locations, uint256 staked)",
    "function blocks(uint256 blockId) external view returns (bytes32 root, uint32 dataTimestamp)",
    "function blocksCountOffset() external view returns (uint32)",
    "function getCurrentValues(bytes32[] keys) external view returns (uint256[] values, uint32[] timestamps)",
    "event LogMint(address indexed minter, uint256 blockId, uint256 staked, uint256 power)",
    "event LogVoter(uint256 indexed blockId, address indexed voter, uint256 vote)",
];

const CHAIN_CONTRACT_NAME: &str = "Chain";

type StatusOutput = (
    U256,
    U256,
    U256,
    U256,
    EthAddress,
    U256,
    Vec<EthAddress>,
    Vec<U256>,
    Vec<String>,
    U256,
);

/// Home chain reader over an ethers provider.
pub struct EvmHomeChain<P> {
    chain_id: String,
    provider: Arc<Provider<P>>,
    registry: EthAddress,
    registry_contract: BaseContract,
    chain_contract: BaseContract,
    metrics: Arc<SyncMetrics>,
}

impl<P: JsonRpcClient + 'static> EvmHomeChain<P> {
    pub fn new(
        chain_id: String,
        provider: Arc<Provider<P>>,
        registry: EthAddress,
        metrics: Arc<SyncMetrics>,
    ) -> SyncResult<Self> {
        let registry_contract = BaseContract::from(
            parse_abi(REGISTRY_ABI).map_err(|e| SyncError::Internal(e.to_string()))?,
        );
        let chain_contract = BaseContract::from(
            parse_abi(CHAIN_ABI).map_err(|e| SyncError::Internal(e.to_string()))?,
        );
        Ok(Self {
            chain_id,
            provider,
            registry,
            registry_contract,
            chain_contract,
            metrics,
        })
    }

    async fn call(&self, method: &str, to: EthAddress, data: Bytes) -> SyncResult<Bytes> {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_id, method])
            .inc();
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider
            .call(&tx, None)
            .await
            .map_err(SyncError::from)
            .tap_err(|e| {
                self.metrics
                    .rpc_errors
                    .with_label_values(&[&self.chain_id, method])
                    .inc();
                tracing::error!("[EvmHomeChain][{}] {} failed: {:?}", self.chain_id, method, e)
            })
    }

    async fn logs(&self, event: &str, address: EthAddress, from: u64, to: u64) -> SyncResult<Vec<Log>> {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_id, "get_logs"])
            .inc();
        let signature = self
            .chain_contract
            .abi()
            .event(event)
            .map_err(|e| SyncError::Internal(e.to_string()))?
            .signature();
        let filter = Filter::new()
            .address(address)
            .topic0(signature)
            .from_block(from)
            .to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(SyncError::from)
            .tap_err(|e| {
                self.metrics
                    .rpc_errors
                    .with_label_values(&[&self.chain_id, "get_logs"])
                    .inc();
                tracing::error!(
                    "[EvmHomeChain][{}] get_logs failed. Filter: {:?}. Error {:?}",
                    self.chain_id,
                    filter,
                    e
                )
            })?;
        // Safeguard check that all events are emitted from requested contract address
        if let Some(log) = logs.iter().find(|log| log.address != address) {
            return Err(SyncError::Rpc(format!(
                "Provider returns logs from different contract address (expected: {:?}): {:?}",
                address, log
            )));
        }
        Ok(logs)
    }
}

fn log_block_number(log: &Log) -> SyncResult<u64> {
    log.block_number
        .map(|n| n.as_u64())
        .ok_or_else(|| SyncError::Rpc("Provider returns log without block_number".into()))
}

#[async_trait]
impl<P: JsonRpcClient + 'static> HomeChain for EvmHomeChain<P> {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn block_number(&self) -> SyncResult<u64> {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_id, "block_number"])
            .inc();
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn status(&self) -> SyncResult<HomeChainStatus> {
        let chain_address = self
            .registry_chain_address()
            .await?
            .ok_or_else(|| SyncError::MissingRegistry(self.chain_id.clone()))?;
        let address = parse_address(&chain_address)?;
        let data = self.chain_contract.encode("getStatus", ())?;
        let output = self.call("getStatus", address, data).await?;
        let (
            block_number,
            time_padding,
            last_data_timestamp,
            last_block_id,
            _next_leader,
            next_block_id,
            validators,
            powers,
            locations,
            _staked,
        ): StatusOutput = self.chain_contract.decode_output("getStatus", output)?;

        if validators.len() != locations.len() || validators.len() != powers.len() {
            return Err(SyncError::Rpc(format!(
                "getStatus returned {} validators, {} locations and {} powers",
                validators.len(),
                locations.len(),
                powers.len()
            )));
        }
        let validators = validators
            .into_iter()
            .zip(locations)
            .zip(powers)
            .map(|((id, location), power)| Validator {
                id: format_address(&id),
                location,
                power,
            })
            .collect();
        Ok(HomeChainStatus {
            block_number: checked_u64(block_number, "block_number")?,
            chain_address,
            next_block_id: checked_u64(next_block_id, "next_block_id")?,
            last_block_id: checked_u64(last_block_id, "last_block_id")?,
            last_data_timestamp: checked_u64(last_data_timestamp, "last_data_timestamp")?,
            time_padding: checked_u64(time_padding, "time_padding")?,
            validators,
        })
    }

    async fn registry_chain_address(&self) -> SyncResult<Option<String>> {
        let data = self
            .registry_contract
            .encode("getAddressByString", CHAIN_CONTRACT_NAME.to_string())?;
        let output = self.call("getAddressByString", self.registry, data).await?;
        let address: EthAddress = self
            .registry_contract
            .decode_output("getAddressByString", output)?;
        if address.is_zero() {
            return Ok(None);
        }
        Ok(Some(format_address(&address)))
    }

    async fn blocks_count_offset(&self, chain_address: &str) -> SyncResult<u64> {
        let address = parse_address(chain_address)?;
        let data = self.chain_contract.encode("blocksCountOffset", ())?;
        let output = self.call("blocksCountOffset", address, data).await?;
        let offset: u32 = self.chain_contract.decode_output("blocksCountOffset", output)?;
        Ok(offset as u64)
    }

    async fn block(&self, chain_address: &str, block_id: u64) -> SyncResult<Option<OnChainBlock>> {
        let address = parse_address(chain_address)?;
        let data = self.chain_contract.encode("blocks", U256::from(block_id))?;
        let output = self.call("blocks", address, data).await?;
        let (root, data_timestamp): ([u8; 32], u32) =
            self.chain_contract.decode_output("blocks", output)?;
        let root = H256::from(root);
        if root.is_zero() && data_timestamp == 0 {
            return Ok(None);
        }
        Ok(Some(OnChainBlock {
            block_id,
            root,
            data_timestamp: data_timestamp as u64,
        }))
    }

    async fn mint_events(
        &self,
        chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<MintEvent>> {
        let address = parse_address(chain_address)?;
        let logs = self.logs("LogMint", address, from_block, to_block).await?;
        logs.into_iter()
            .map(|log| {
                let anchor = log_block_number(&log)?;
                let (minter, block_id, staked, power): (EthAddress, U256, U256, U256) = self
                    .chain_contract
                    .decode_event("LogMint", log.topics, log.data)?;
                Ok(MintEvent {
                    block_id: checked_u64(block_id, "blockId")?,
                    minter: format_address(&minter),
                    staked,
                    power,
                    anchor,
                    chain_address: format_address(&address),
                })
            })
            .collect()
    }

    async fn voter_events(
        &self,
        chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<VoterEvent>> {
        let address = parse_address(chain_address)?;
        let logs = self.logs("LogVoter", address, from_block, to_block).await?;
        logs.into_iter()
            .map(|log| {
                let (block_id, voter, vote): (U256, EthAddress, U256) = self
                    .chain_contract
                    .decode_event("LogVoter", log.topics, log.data)?;
                Ok(VoterEvent {
                    block_id: checked_u64(block_id, "blockId")?,
                    voter: format_address(&voter),
                    vote,
                })
            })
            .collect()
    }

    async fn fcds(&self, chain_address: &str, keys: &[String]) -> SyncResult<Vec<FcdValue>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let address = parse_address(chain_address)?;
        let encoded_keys: Vec<[u8; 32]> = keys.iter().map(|k| key_to_bytes32(k)).collect();
        let data = self.chain_contract.encode("getCurrentValues", encoded_keys)?;
        let output = self.call("getCurrentValues", address, data).await?;
        let (values, timestamps): (Vec<U256>, Vec<u32>) =
            self.chain_contract.decode_output("getCurrentValues", output)?;
        Ok(keys
            .iter()
            .zip(values)
            .zip(timestamps)
            // never written on chain
            .filter(|(_, timestamp)| *timestamp > 0)
            .map(|((key, value), timestamp)| FcdValue {
                key: key.clone(),
                value: u256_to_f64(value, 18),
                data_timestamp: timestamp as u64,
            })
            .collect())
    }
}
