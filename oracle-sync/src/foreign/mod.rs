// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Replication of finalized home blocks onto foreign chains.
//!
//! Every chain family implements the small `ForeignChainContract` hook set;
//! eligibility, block selection and bookkeeping are shared.

mod block_replicator;
mod chain_replicator;
mod evm;
mod json_rpc;

pub use block_replicator::{can_mint, BlockReplicator};
pub use chain_replicator::{
    CooldownPolicy, DispatcherPolicy, ForeignChainReplicator, ReplicationOutcome,
};
pub use evm::EvmForeignChain;
pub use json_rpc::JsonRpcForeignChain;

use crate::error::SyncResult;
use crate::types::{BlockSubmission, ForeignChainStatus, TxReceipt};
use async_trait::async_trait;
use ethers::types::U256;

#[async_trait]
pub trait ForeignChainContract: Send + Sync {
    fn chain_id(&self) -> &str;

    /// Account paying for submissions, recorded as the replication minter.
    fn wallet_address(&self) -> String;

    async fn status(&self) -> SyncResult<ForeignChainStatus>;

    /// Dispatcher architecture marker of the deployed contract.
    async fn architecture_version(&self) -> SyncResult<u32>;

    /// Native balance of the wallet in the chain's smallest unit.
    async fn balance(&self) -> SyncResult<U256>;

    /// Submits one block and waits for its receipt.
    async fn submit(
        &self,
        submission: &BlockSubmission,
        status: &ForeignChainStatus,
    ) -> SyncResult<TxReceipt>;
}
