// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{SyncError, SyncResult};
use anyhow::Context;
use ethers::core::k256::ecdsa::SigningKey;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{Signer, Wallet};
use ethers::types::{Address as EthAddress, H256, I256, U256};
use ethers::utils::{format_units, parse_units};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type EthSigner = SignerMiddleware<Provider<Http>, Wallet<SigningKey>>;

pub async fn get_eth_signer_client(url: &str, private_key_hex: &str) -> anyhow::Result<EthSigner> {
    let provider = Provider::<Http>::try_from(url)
        .with_context(|| format!("Invalid rpc url {}", url))?
        .interval(std::time::Duration::from_millis(2000));
    let chain_id = provider.get_chainid().await?;
    let wallet = Wallet::from_str(private_key_hex)
        .context("Invalid private key")?
        .with_chain_id(chain_id.as_u64());
    Ok(SignerMiddleware::new(provider, wallet))
}

/// Lowercase 0x hex form used in every persisted record.
pub fn format_address(address: &EthAddress) -> String {
    format!("{:?}", address)
}

pub fn parse_address(address: &str) -> SyncResult<EthAddress> {
    EthAddress::from_str(address)
        .map_err(|e| SyncError::Internal(format!("invalid address {}: {}", address, e)))
}

pub fn format_h256(hash: &H256) -> String {
    format!("{:?}", hash)
}

pub fn parse_h256(hash: &str) -> SyncResult<H256> {
    H256::from_str(hash).map_err(|e| SyncError::Internal(format!("invalid hash {}: {}", hash, e)))
}

pub fn decode_hex(value: &str) -> SyncResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| SyncError::Internal(format!("invalid hex {}: {}", value, e)))
}

/// Right padded utf8 key, truncated to 32 bytes.
pub fn key_to_bytes32(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = key.as_bytes();
    let len = bytes.len().min(32);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

pub fn u256_to_f64(value: U256, decimals: u32) -> f64 {
    format_units(value, decimals)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

/// Narrows a contract supplied integer, failing instead of truncating.
pub fn checked_u64(value: U256, field: &str) -> SyncResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(SyncError::Rpc(format!("{} {} does not fit in u64", field, value)));
    }
    Ok(value.as_u64())
}

/// Fixed point encoding of `value` with `decimals` digits, as a 32 byte word.
pub fn encode_fixed(value: f64, decimals: u32) -> SyncResult<[u8; 32]> {
    let formatted = format!("{:.*}", decimals as usize, value.abs());
    let magnitude: U256 = parse_units(formatted, decimals)
        .map_err(|e| SyncError::Internal(format!("cannot encode {}: {}", value, e)))?
        .into();
    let signed = I256::from_raw(magnitude);
    let signed = if value < 0.0 { -signed } else { signed };
    Ok(i256_to_bytes(signed))
}

/// Signed integer encoding as a 32 byte two's complement word.
pub fn encode_integer(value: f64) -> SyncResult<[u8; 32]> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(SyncError::Internal(format!("{} is not an integer", value)));
    }
    Ok(i256_to_bytes(I256::from(value as i64)))
}

fn i256_to_bytes(value: I256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.into_raw().to_big_endian(&mut out);
    out
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
