// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use oracle_sync_schema::StoreError;

/// Error type for sync and replication cycles
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    // Chain RPC failure (provider, transport, decoding of a provider answer)
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Validator HTTP endpoint failure
    #[error("Validator error: {0}")]
    Validator(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    // Receipt not observed within the destination round length
    #[error("Transaction {tx_hash} timed out after {timeout_secs}s")]
    TxTimeout { tx_hash: String, timeout_secs: u64 },

    #[error("Root mismatch for block {block_id}: expected {expected}, got {actual}")]
    RootMismatch {
        block_id: u64,
        expected: String,
        actual: String,
    },

    #[error("Block {block_id} is missing required fields: {fields:?}")]
    CorruptedBlock {
        block_id: u64,
        fields: Vec<&'static str>,
    },

    #[error("Chain {chain_id} reverted: last block {last_block_id}, next block {next_block_id}")]
    ChainReverted {
        chain_id: String,
        last_block_id: u64,
        next_block_id: u64,
    },

    #[error("Registry has no address for {0}")]
    MissingRegistry(String),

    #[error("Insufficient balance on {chain_id}: {balance} below {threshold}")]
    InsufficientBalance {
        chain_id: String,
        balance: String,
        threshold: String,
    },

    #[error("Replication of {0} blocks in one cycle is not supported")]
    MultiBlockReplication(usize),

    #[error("Unknown chain id: {0}")]
    UnknownChain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            SyncError::Rpc(_) => "rpc",
            SyncError::Timeout(_) => "timeout",
            SyncError::Validator(_) => "validator",
            SyncError::NonceConflict(_) => "nonce_conflict",
            SyncError::TxTimeout { .. } => "tx_timeout",
            SyncError::RootMismatch { .. } => "root_mismatch",
            SyncError::CorruptedBlock { .. } => "corrupted_block",
            SyncError::ChainReverted { .. } => "chain_reverted",
            SyncError::MissingRegistry(_) => "missing_registry",
            SyncError::InsufficientBalance { .. } => "insufficient_balance",
            SyncError::MultiBlockReplication(_) => "multi_block_replication",
            SyncError::UnknownChain(_) => "unknown_chain",
            SyncError::Config(_) => "config",
            SyncError::Storage(_) => "storage",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether the next scheduled cycle is expected to succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Rpc(_)
                | SyncError::Timeout(_)
                | SyncError::Validator(_)
                | SyncError::NonceConflict(_)
                | SyncError::TxTimeout { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<ethers::providers::ProviderError> for SyncError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        SyncError::Rpc(e.to_string())
    }
}

impl From<ethers::abi::AbiError> for SyncError {
    fn from(e: ethers::abi::AbiError) -> Self {
        SyncError::Rpc(format!("abi: {}", e))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout(e.to_string())
        } else {
            SyncError::Validator(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Internal(format!("json: {}", e))
    }
}
