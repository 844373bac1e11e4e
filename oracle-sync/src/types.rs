// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transient values read from chains and validators. None of these are persisted.

use ethers::types::{H256, U256};
use oracle_sync_schema::{Block, Fcd};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    /// Lowercase 0x address.
    pub id: String,
    /// Base url of the validator API.
    pub location: String,
    pub power: U256,
}

/// Home chain contract status as seen at `block_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeChainStatus {
    pub block_number: u64,
    pub chain_address: String,
    pub next_block_id: u64,
    pub last_block_id: u64,
    pub last_data_timestamp: u64,
    pub time_padding: u64,
    pub validators: Vec<Validator>,
}

impl HomeChainStatus {
    /// Voter address to validator location.
    pub fn locations(&self) -> HashMap<String, String> {
        self.validators
            .iter()
            .map(|v| (v.id.to_lowercase(), v.location.clone()))
            .collect()
    }
}

/// Block data stored by the chain contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainBlock {
    pub block_id: u64,
    pub root: H256,
    pub data_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintEvent {
    pub block_id: u64,
    pub minter: String,
    pub staked: U256,
    pub power: U256,
    /// Home chain height of the log.
    pub anchor: u64,
    pub chain_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterEvent {
    pub block_id: u64,
    pub voter: String,
    pub vote: U256,
}

/// Foreign chain status, always re-fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignChainStatus {
    pub chain_address: String,
    pub last_block_id: u64,
    pub last_data_timestamp: u64,
    pub time_padding: u64,
    pub next_block_id: u64,
}

/// Outcome of verifying a block's leaves against its consensus root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafVerification {
    Verified,
    /// Every usable validator answer produced a different root.
    Rejected,
    /// No validator answered with usable data. Retry on the next cycle.
    Inconclusive,
}

/// Leaf payload served by a validator for one block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorBlockData {
    /// Key to 0x hex encoded value.
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub numeric_fcd_keys: Vec<String>,
    #[serde(default)]
    pub numeric_fcd_values: Vec<f64>,
}

/// Result of one replication attempt on a foreign chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStatus {
    pub blocks: Vec<Block>,
    /// Foreign chain heights of the mint transactions, parallel to `blocks`.
    pub anchors: Vec<u64>,
    pub fcds: Vec<Fcd>,
    pub errors: Vec<String>,
}

impl ReplicationStatus {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.errors.is_empty()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// 1 on success.
    pub status: u64,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// Transaction parameters chosen by the sender and passed to the submit closure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOverrides {
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub nonce: Option<U256>,
}

/// Block payload submitted to a foreign chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSubmission {
    pub block_id: u64,
    pub data_timestamp: u64,
    pub root: H256,
    pub fcd_keys: Vec<String>,
    /// 32 byte encoded values, parallel to `fcd_keys`.
    pub fcd_values: Vec<[u8; 32]>,
}
