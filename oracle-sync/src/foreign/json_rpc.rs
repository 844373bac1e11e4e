// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Generic non-EVM foreign chain reached through a JSON-RPC gateway.
//!
//! The gateway owns signing. First-class-data slots must exist before a
//! submission references them; they are created on first use and remembered
//! for the lifetime of the process.

use super::ForeignChainContract;
use crate::config::ValidatedForeignChain;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::types::{BlockSubmission, ForeignChainStatus, TxReceipt};
use crate::utils::{format_h256, parse_h256};
use async_trait::async_trait;
use ethers::types::U256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResult {
    last_block_id: u64,
    last_data_timestamp: u64,
    time_padding: u64,
    next_block_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResult {
    tx_hash: String,
    block_number: u64,
    status: u64,
}

pub struct JsonRpcForeignChain {
    chain_id: String,
    rpc_url: String,
    contract_address: String,
    wallet_address: String,
    http_client: reqwest::Client,
    transaction_timeout: Duration,
    request_id: AtomicU64,
    initialized_fcds: RwLock<HashSet<String>>,
    metrics: Arc<SyncMetrics>,
}

impl JsonRpcForeignChain {
    pub fn new(chain: &ValidatedForeignChain, metrics: Arc<SyncMetrics>) -> SyncResult<Self> {
        let settings = &chain.settings;
        let wallet_address = settings.wallet_address.clone().ok_or_else(|| {
            SyncError::Config(format!("{}: wallet-address is required", chain.chain_id))
        })?;
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build http client: {}", e)))?;
        Ok(Self {
            chain_id: chain.chain_id.clone(),
            rpc_url: settings.rpc_url.clone(),
            contract_address: settings.contract_address.clone(),
            wallet_address,
            http_client,
            transaction_timeout: settings.transaction_timeout(),
            request_id: AtomicU64::new(1),
            initialized_fcds: RwLock::new(HashSet::new()),
            metrics,
        })
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> SyncResult<R> {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_id, method])
            .inc();
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let result = self.send(&body, timeout).await;
        if result.is_err() {
            self.metrics
                .rpc_errors
                .with_label_values(&[&self.chain_id, method])
                .inc();
        }
        result
    }

    async fn send<R: DeserializeOwned>(
        &self,
        body: &JsonRpcRequest<'_>,
        timeout: Duration,
    ) -> SyncResult<R> {
        let method = body.method;
        let response = self
            .http_client
            .post(&self.rpc_url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;
        let response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| transport_error(method, e))?;
        match (response.result, response.error) {
            (_, Some(error)) => Err(SyncError::Rpc(format!(
                "{} failed with code {}: {}",
                method, error.code, error.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(SyncError::Rpc(format!("{} returned no result", method))),
        }
    }

    /// Creates missing FCD slots for `keys`.
    async fn ensure_fcds(&self, keys: &[String]) -> SyncResult<()> {
        let missing: Vec<String> = {
            let known = self.initialized_fcds.read().await;
            keys.iter().filter(|k| !known.contains(*k)).cloned().collect()
        };
        for key in missing {
            let initialized: bool = self
                .request(
                    "oracle_fcdInitialized",
                    json!({ "contract": self.contract_address, "key": key }),
                    self.transaction_timeout,
                )
                .await?;
            if !initialized {
                let created: bool = self
                    .request(
                        "oracle_initializeFcd",
                        json!({
                            "contract": self.contract_address,
                            "wallet": self.wallet_address,
                            "key": key,
                        }),
                        self.transaction_timeout,
                    )
                    .await?;
                if !created {
                    return Err(SyncError::Rpc(format!("fcd slot {} was not created", key)));
                }
                info!("[JsonRpcForeignChain][{}] Initialized fcd {}", self.chain_id, key);
            }
            self.initialized_fcds.write().await.insert(key);
        }
        Ok(())
    }
}

fn transport_error(method: &str, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(format!("{}: {}", method, e))
    } else {
        SyncError::Rpc(format!("{}: {}", method, e))
    }
}

#[async_trait]
impl ForeignChainContract for JsonRpcForeignChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn wallet_address(&self) -> String {
        self.wallet_address.clone()
    }

    async fn status(&self) -> SyncResult<ForeignChainStatus> {
        let status: StatusResult = self
            .request(
                "oracle_getStatus",
                json!({ "contract": self.contract_address }),
                self.transaction_timeout,
            )
            .await?;
        Ok(ForeignChainStatus {
            chain_address: self.contract_address.clone(),
            last_block_id: status.last_block_id,
            last_data_timestamp: status.last_data_timestamp,
            time_padding: status.time_padding,
            next_block_id: status.next_block_id,
        })
    }

    async fn architecture_version(&self) -> SyncResult<u32> {
        self.request(
            "oracle_architectureVersion",
            json!({ "contract": self.contract_address }),
            self.transaction_timeout,
        )
        .await
    }

    async fn balance(&self) -> SyncResult<U256> {
        let balance: String = self
            .request(
                "oracle_balance",
                json!({ "wallet": self.wallet_address }),
                self.transaction_timeout,
            )
            .await?;
        U256::from_dec_str(&balance)
            .map_err(|e| SyncError::Rpc(format!("invalid balance {}: {}", balance, e)))
    }

    async fn submit(
        &self,
        submission: &BlockSubmission,
        status: &ForeignChainStatus,
    ) -> SyncResult<TxReceipt> {
        self.ensure_fcds(&submission.fcd_keys).await?;
        let timeout = Duration::from_secs(status.time_padding).max(self.transaction_timeout);
        let params = json!({
            "contract": self.contract_address,
            "wallet": self.wallet_address,
            "blockId": submission.block_id,
            "dataTimestamp": submission.data_timestamp,
            "root": format_h256(&submission.root),
            "keys": submission.fcd_keys,
            "values": submission
                .fcd_values
                .iter()
                .map(|v| format!("0x{}", hex::encode(v)))
                .collect::<Vec<_>>(),
        });
        let result: SubmitResult = self.request("oracle_submit", params, timeout).await?;
        Ok(TxReceipt {
            tx_hash: parse_h256(&result.tx_hash)?,
            block_number: result.block_number,
            status: result.status,
        })
    }
}
