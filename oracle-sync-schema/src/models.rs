// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable records owned by the document store.
//!
//! Every record carries a deterministic identity derived from its content so
//! that re-processing after a crash deduplicates through upserts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Chain identifier as used in configuration and persisted records, e.g. `"bsc"`.
pub type ChainId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Minted on the home chain, leaves not yet verified.
    Completed,
    /// Leaves verified against the consensus root.
    Finalized,
    /// Leaf verification finished without a matching root.
    Failed,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Completed => "completed",
            BlockStatus::Finalized => "finalized",
            BlockStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(BlockStatus::Completed),
            "finalized" => Some(BlockStatus::Finalized),
            "failed" => Some(BlockStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_id: u64,
    pub status: BlockStatus,
    pub data_timestamp: u64,
    /// 0x-prefixed 32 byte Merkle root.
    pub root: String,
    /// Decimal encoded aggregate stake.
    pub staked: String,
    pub power: String,
    pub voters: Vec<String>,
    /// Voter address to decimal encoded vote weight.
    pub votes: BTreeMap<String, String>,
    /// First-class-data annotations taken from the verified leaf payload.
    #[serde(default)]
    pub fcd: BTreeMap<String, f64>,
    /// Home chain contract that minted the block.
    pub chain_address: String,
    /// Home chain height of the mint event.
    pub anchor: u64,
}

impl Block {
    pub fn id(&self) -> String {
        block_key(self.block_id)
    }

    /// Names of required fields that are empty. A non-empty answer means the
    /// record is corrupted and must not be processed.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.root.is_empty() {
            missing.push("root");
        }
        if self.data_timestamp == 0 {
            missing.push("dataTimestamp");
        }
        if self.voters.is_empty() {
            missing.push("voters");
        }
        if self.chain_address.is_empty() {
            missing.push("chainAddress");
        }
        missing
    }
}

pub fn block_key(block_id: u64) -> String {
    format!("block::{}", block_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaf {
    pub block_id: u64,
    pub key: String,
    /// 0x-prefixed encoded feed value.
    pub value: String,
    /// Ordered 0x-prefixed sibling hashes.
    pub proof: Vec<String>,
}

impl Leaf {
    pub fn id(&self) -> String {
        leaf_key(self.block_id, &self.key)
    }
}

pub fn leaf_key(block_id: u64, key: &str) -> String {
    format!("leaf::{}::{}", block_id, key)
}

/// A deployed contract incarnation for a chain. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInstance {
    pub chain_id: ChainId,
    pub address: String,
    pub anchor: u64,
    pub blocks_count_offset: u64,
}

impl ChainInstance {
    pub fn id(&self) -> String {
        format!("chain_instance::{}::{}", self.chain_id, self.address.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRecordStatus {
    /// Mint observed on the home chain.
    Minted,
    /// Submission confirmed on a foreign chain.
    Replicated,
}

impl ReplicationRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationRecordStatus::Minted => "minted",
            ReplicationRecordStatus::Replicated => "replicated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minted" => Some(ReplicationRecordStatus::Minted),
            "replicated" => Some(ReplicationRecordStatus::Replicated),
            _ => None,
        }
    }
}

/// Links a home block to the chain it was minted or replicated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationRecord {
    pub chain_id: ChainId,
    pub block_id: u64,
    pub anchor: u64,
    pub chain_address: String,
    pub minter: String,
    pub status: ReplicationRecordStatus,
}

impl ReplicationRecord {
    pub fn id(&self) -> String {
        replication_key(&self.chain_id, self.block_id)
    }
}

pub fn replication_key(chain_id: &str, block_id: u64) -> String {
    format!("replication::{}::{}", block_id, chain_id)
}

/// Latest first-class-data value known for a key on a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fcd {
    pub key: String,
    pub chain_id: ChainId,
    pub value: f64,
    pub data_timestamp: u64,
}

impl Fcd {
    pub fn id(&self) -> String {
        format!("fcd::{}::{}", self.chain_id, self.key)
    }
}

pub fn last_block_checked_for_new_contract(chain_id: &str) -> String {
    format!("LAST_BLOCK_CHECKED_FOR_NEW_CONTRACT:{}", chain_id)
}

pub fn last_block_checked_for_mint_event(chain_id: &str) -> String {
    format!("LAST_BLOCK_CHECKED_FOR_MINT_EVENT:{}", chain_id)
}

/// Unix millis until which an upgraded foreign chain is skipped.
pub fn dispatcher_cooldown_until(chain_id: &str) -> String {
    format!("DISPATCHER_COOLDOWN_UNTIL:{}", chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_deterministic() {
        assert_eq!(block_key(42), "block::42");
        assert_eq!(leaf_key(42, "ETH-USD"), "leaf::42::ETH-USD");
        assert_eq!(replication_key("bsc", 42), "replication::42::bsc");

        let instance = ChainInstance {
            chain_id: "bsc".to_string(),
            address: "0xABCD".to_string(),
            anchor: 100,
            blocks_count_offset: 5,
        };
        assert_eq!(instance.id(), "chain_instance::bsc::0xabcd");
    }

    #[test]
    fn test_missing_required_fields() {
        let mut block = Block {
            block_id: 1,
            status: BlockStatus::Completed,
            data_timestamp: 1000,
            root: "0x01".to_string(),
            staked: "1".to_string(),
            power: "1".to_string(),
            voters: vec!["0xaa".to_string()],
            votes: BTreeMap::new(),
            fcd: BTreeMap::new(),
            chain_address: "0xchain".to_string(),
            anchor: 7,
        };
        assert!(block.missing_required_fields().is_empty());

        block.root.clear();
        block.voters.clear();
        assert_eq!(block.missing_required_fields(), vec!["root", "voters"]);
    }
}
