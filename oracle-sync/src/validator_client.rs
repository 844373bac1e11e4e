// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{SyncError, SyncResult};
use crate::types::ValidatorBlockData;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Fetches the full leaf set a validator signed for a block.
#[async_trait]
pub trait ValidatorClient: Send + Sync {
    /// `Ok(None)` when the validator answered without usable data.
    async fn block_leaves(
        &self,
        location: &str,
        block_id: u64,
    ) -> SyncResult<Option<ValidatorBlockData>>;
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    data: Option<ValidatorBlockData>,
}

#[derive(Clone, Debug)]
pub struct HttpValidatorClient {
    http_client: reqwest::Client,
}

impl HttpValidatorClient {
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build http client: {}", e)))?;
        Ok(Self { http_client })
    }
}

pub fn block_url(location: &str, block_id: u64) -> String {
    format!("{}/blocks/height/{}", location.trim_end_matches('/'), block_id)
}

#[async_trait]
impl ValidatorClient for HttpValidatorClient {
    async fn block_leaves(
        &self,
        location: &str,
        block_id: u64,
    ) -> SyncResult<Option<ValidatorBlockData>> {
        let url = block_url(location, block_id);
        let response = self.http_client.get(&url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!(
                "[ValidatorClient] {} answered with status {}",
                url,
                response.status()
            );
            return Ok(None);
        }
        let body: BlockResponse = response.json().await?;
        Ok(body.data.filter(|d| !d.data.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_url() {
        assert_eq!(
            block_url("https://validator.example.com/", 42),
            "https://validator.example.com/blocks/height/42"
        );
    }

    #[test]
    fn test_response_shape() {
        let body: BlockResponse = serde_json::from_str(
            r#"{"data":{"data":{"ETH-USD":"0x01"},"numericFcdKeys":["ETH-USD"],"numericFcdValues":[1850.5]}}"#,
        )
        .unwrap();
        let data = body.data.unwrap();
        assert_eq!(data.data.get("ETH-USD").unwrap(), "0x01");
        assert_eq!(data.numeric_fcd_keys, vec!["ETH-USD".to_string()]);
        assert_eq!(data.numeric_fcd_values, vec![1850.5]);

        let empty: BlockResponse = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(empty.data.is_none());
    }
}
