// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read access to the home chain where validators mint blocks.

mod evm;

pub use evm::EvmHomeChain;

use crate::error::SyncResult;
use crate::types::{HomeChainStatus, MintEvent, OnChainBlock, VoterEvent};
use async_trait::async_trait;

/// Latest first-class-data value kept by the home chain contract.
#[derive(Debug, Clone, PartialEq)]
pub struct FcdValue {
    pub key: String,
    pub value: f64,
    pub data_timestamp: u64,
}

#[async_trait]
pub trait HomeChain: Send + Sync {
    fn chain_id(&self) -> &str;

    async fn block_number(&self) -> SyncResult<u64>;

    async fn status(&self) -> SyncResult<HomeChainStatus>;

    /// Current Chain contract registered in the registry, `None` when unset.
    async fn registry_chain_address(&self) -> SyncResult<Option<String>>;

    async fn blocks_count_offset(&self, chain_address: &str) -> SyncResult<u64>;

    /// Block stored by the contract at `chain_address`, `None` if it holds no such block.
    async fn block(&self, chain_address: &str, block_id: u64) -> SyncResult<Option<OnChainBlock>>;

    async fn mint_events(
        &self,
        chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<MintEvent>>;

    async fn voter_events(
        &self,
        chain_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<VoterEvent>>;

    async fn fcds(&self, chain_address: &str, keys: &[String]) -> SyncResult<Vec<FcdValue>>;
}
