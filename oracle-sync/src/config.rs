// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{SyncError, SyncResult};
use ethers::types::{Address as EthAddress, U256};
use ethers::utils::parse_units;
use oracle_sync_config::Config;
use oracle_sync_schema::ChainId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OracleSyncConfig {
    // The port that serves prometheus metrics.
    pub metrics_port: u16,
    pub home_chain: HomeChainSettings,
    #[serde(default)]
    pub foreign_chains: BTreeMap<ChainId, ForeignChainSettings>,
    #[serde(default)]
    pub block_synchronizer: BlockSynchronizerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Config for OracleSyncConfig {}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HomeChainSettings {
    pub chain_id: ChainId,
    pub rpc_url: String,
    // Registry contract that resolves the current Chain contract address.
    pub registry_address: String,
    // Number of already scanned blocks to scan again on every pass.
    #[serde(default = "default_rescan_depth")]
    pub rescan_depth: u64,
    // Maximum number of blocks to query in a single log request.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    // First-class-data keys refreshed from the chain on every scan.
    #[serde(default)]
    pub fcd_keys: Vec<String>,
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,
}

impl HomeChainSettings {
    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainFamily {
    Evm,
    JsonRpc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FcdValueType {
    /// Decimal value submitted as an 18 decimals fixed point number.
    #[default]
    Numeric,
    /// Value submitted as a plain signed integer.
    Integer,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FcdKeyConfig {
    pub key: String,
    #[serde(default)]
    pub value_type: FcdValueType,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ForeignChainSettings {
    pub family: ChainFamily,
    pub rpc_url: String,
    // Chain contract that accepts replicated blocks.
    pub contract_address: String,
    // Name of the environment variable holding the EVM wallet private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_env: Option<String>,
    // Account used by a json-rpc chain to sign submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    // Gas price bounds in wei.
    #[serde(default = "default_min_gas_price")]
    pub min_gas_price: u64,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u64,
    // Native token amounts in whole units, e.g. "0.5".
    #[serde(default = "default_balance_warning_threshold")]
    pub balance_warning_threshold: String,
    #[serde(default = "default_balance_error_threshold")]
    pub balance_error_threshold: String,
    #[serde(default = "default_native_decimals")]
    pub native_decimals: u32,
    #[serde(default)]
    pub fcd_keys: Vec<FcdKeyConfig>,
    // Lower bound for the receipt timeout, seconds.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    // Sleep applied to a chain that moved to the dispatcher architecture, seconds.
    #[serde(default = "default_dispatcher_cooldown_secs")]
    pub dispatcher_cooldown_secs: u64,
    // Contract architecture version from which the chain is served by a dispatcher.
    #[serde(default = "default_dispatcher_architecture_version")]
    pub dispatcher_architecture_version: u32,
}

impl ForeignChainSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn dispatcher_cooldown(&self) -> Duration {
        Duration::from_secs(self.dispatcher_cooldown_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockSynchronizerSettings {
    // Completed blocks verified per cycle.
    #[serde(default = "default_completed_batch_size")]
    pub completed_batch_size: usize,
    // Finalized/failed blocks re-verified against the chain per cycle.
    #[serde(default = "default_reverification_window")]
    pub reverification_window: usize,
    #[serde(default = "default_validator_request_timeout_ms")]
    pub validator_request_timeout_ms: u64,
}

impl Default for BlockSynchronizerSettings {
    fn default() -> Self {
        Self {
            completed_batch_size: default_completed_batch_size(),
            reverification_window: default_reverification_window(),
            validator_request_timeout_ms: default_validator_request_timeout_ms(),
        }
    }
}

impl BlockSynchronizerSettings {
    pub fn validator_request_timeout(&self) -> Duration {
        Duration::from_millis(self.validator_request_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobSchedule {
    #[serde(default = "default_job_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            interval_ms: default_job_interval_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl JobSchedule {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerSettings {
    #[serde(default)]
    pub home_chain: JobSchedule,
    // Defaults for foreign chains without an explicit entry.
    #[serde(default)]
    pub foreign_chain_default: JobSchedule,
    #[serde(default)]
    pub foreign_chains: BTreeMap<ChainId, JobSchedule>,
    #[serde(default = "default_consumers")]
    pub consumers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            home_chain: JobSchedule::default(),
            foreign_chain_default: JobSchedule::default(),
            foreign_chains: BTreeMap::new(),
            consumers: default_consumers(),
        }
    }
}

fn default_rescan_depth() -> u64 {
    5
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_max_retry_secs() -> u64 {
    30
}

fn default_min_gas_price() -> u64 {
    1_000_000_000 // 1 gwei
}

fn default_max_gas_price() -> u64 {
    500_000_000_000
}

fn default_balance_warning_threshold() -> String {
    "0.1".to_string()
}

fn default_balance_error_threshold() -> String {
    "0.01".to_string()
}

fn default_native_decimals() -> u32 {
    18
}

fn default_transaction_timeout_secs() -> u64 {
    60
}

fn default_receipt_poll_interval_ms() -> u64 {
    1000
}

fn default_dispatcher_cooldown_secs() -> u64 {
    300
}

fn default_dispatcher_architecture_version() -> u32 {
    2
}

fn default_completed_batch_size() -> usize {
    10
}

fn default_reverification_window() -> usize {
    5
}

fn default_validator_request_timeout_ms() -> u64 {
    5000
}

fn default_job_interval_ms() -> u64 {
    5000
}

fn default_lock_ttl_ms() -> u64 {
    120_000
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// Records and job locks live in this process only.
    #[default]
    Memory,
    /// Records and job locks are shared by every node on the same database.
    Postgres,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub database_url: Option<String>,
    // Number of connections to keep in the pool.
    #[serde(default = "default_db_connection_pool_size")]
    pub db_connection_pool_size: u32,
    // Time spent waiting for a pooled connection, in milliseconds.
    #[serde(default = "default_db_connection_timeout_ms")]
    pub db_connection_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: None,
            db_connection_pool_size: default_db_connection_pool_size(),
            db_connection_timeout_ms: default_db_connection_timeout_ms(),
        }
    }
}

impl StorageSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.backend == StorageBackend::Memory {
            return Ok(());
        }
        let database_url = self.database_url.as_deref().unwrap_or("");
        if database_url.is_empty() {
            return Err(config_err("storage database-url is required for postgres"));
        }
        let url = url::Url::parse(database_url)
            .map_err(|e| config_err(format!("invalid storage database-url: {}", e)))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(config_err(format!(
                "storage database-url has unsupported scheme {}",
                url.scheme()
            )));
        }
        if self.db_connection_pool_size == 0 {
            return Err(config_err("storage db-connection-pool-size must be positive"));
        }
        Ok(())
    }
}

fn default_db_connection_pool_size() -> u32 {
    10
}

fn default_db_connection_timeout_ms() -> u64 {
    60_000
}

// Headroom a foreign chain lock keeps over one transaction wait.
const LOCK_TTL_MARGIN: Duration = Duration::from_secs(30);

fn default_consumers() -> usize {
    4
}

/// Foreign chain settings with thresholds parsed into native base units.
#[derive(Clone, Debug)]
pub struct ValidatedForeignChain {
    pub chain_id: ChainId,
    pub settings: ForeignChainSettings,
    pub balance_warning: U256,
    pub balance_error: U256,
    pub schedule: JobSchedule,
}

/// Immutable configuration handed to the node after start-up checks.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub metrics_port: u16,
    pub home_chain: HomeChainSettings,
    pub home_registry: EthAddress,
    pub home_schedule: JobSchedule,
    pub block_synchronizer: BlockSynchronizerSettings,
    pub foreign_chains: BTreeMap<ChainId, ValidatedForeignChain>,
    pub consumers: usize,
    pub storage: StorageSettings,
}

impl OracleSyncConfig {
    pub fn validate(&self) -> SyncResult<ValidatedConfig> {
        info!("Starting config validation");
        let home = &self.home_chain;
        if home.chain_id.is_empty() {
            return Err(config_err("home chain id is empty"));
        }
        validate_rpc_url(&home.chain_id, &home.rpc_url)?;
        let home_registry = parse_address(&home.chain_id, "registry-address", &home.registry_address)?;
        if home.max_block_range == 0 {
            return Err(config_err("home chain max-block-range must be positive"));
        }

        let mut foreign_chains = BTreeMap::new();
        for (chain_id, settings) in &self.foreign_chains {
            if chain_id == &home.chain_id {
                return Err(config_err(format!(
                    "foreign chain {} is the home chain",
                    chain_id
                )));
            }
            validate_rpc_url(chain_id, &settings.rpc_url)?;
            match settings.family {
                ChainFamily::Evm => {
                    parse_address(chain_id, "contract-address", &settings.contract_address)?;
                    if settings.private_key_env.as_deref().unwrap_or("").is_empty() {
                        return Err(config_err(format!(
                            "{}: private-key-env is required for evm chains",
                            chain_id
                        )));
                    }
                }
                ChainFamily::JsonRpc => {
                    if settings.contract_address.is_empty() {
                        return Err(config_err(format!("{}: contract-address is empty", chain_id)));
                    }
                    if settings.wallet_address.as_deref().unwrap_or("").is_empty() {
                        return Err(config_err(format!(
                            "{}: wallet-address is required for json-rpc chains",
                            chain_id
                        )));
                    }
                }
            }
            if settings.min_gas_price > settings.max_gas_price {
                return Err(config_err(format!(
                    "{}: min-gas-price {} is above max-gas-price {}",
                    chain_id, settings.min_gas_price, settings.max_gas_price
                )));
            }
            let balance_warning = parse_amount(
                chain_id,
                &settings.balance_warning_threshold,
                settings.native_decimals,
            )?;
            let balance_error = parse_amount(
                chain_id,
                &settings.balance_error_threshold,
                settings.native_decimals,
            )?;
            if balance_warning < balance_error {
                return Err(config_err(format!(
                    "{}: balance-warning-threshold is below balance-error-threshold",
                    chain_id
                )));
            }
            let schedule = self
                .scheduler
                .foreign_chains
                .get(chain_id)
                .cloned()
                .unwrap_or_else(|| self.scheduler.foreign_chain_default.clone());
            validate_schedule(chain_id, &schedule)?;
            let min_lock_ttl = settings.transaction_timeout() + LOCK_TTL_MARGIN;
            if schedule.lock_ttl() < min_lock_ttl {
                return Err(config_err(format!(
                    "{}: lock-ttl-ms {} is below the transaction timeout plus {:?}",
                    chain_id, schedule.lock_ttl_ms, LOCK_TTL_MARGIN
                )));
            }
            foreign_chains.insert(
                chain_id.clone(),
                ValidatedForeignChain {
                    chain_id: chain_id.clone(),
                    settings: settings.clone(),
                    balance_warning,
                    balance_error,
                    schedule,
                },
            );
        }

        for chain_id in self.scheduler.foreign_chains.keys() {
            if !self.foreign_chains.contains_key(chain_id) {
                return Err(SyncError::UnknownChain(format!(
                    "scheduler entry {} has no foreign chain settings",
                    chain_id
                )));
            }
        }
        validate_schedule(&home.chain_id, &self.scheduler.home_chain)?;
        if self.scheduler.consumers == 0 {
            return Err(config_err("scheduler consumers must be positive"));
        }
        self.storage.validate()?;

        info!(
            "Config validated: home chain {}, {} foreign chains",
            home.chain_id,
            foreign_chains.len()
        );
        Ok(ValidatedConfig {
            metrics_port: self.metrics_port,
            home_chain: home.clone(),
            home_registry,
            home_schedule: self.scheduler.home_chain.clone(),
            block_synchronizer: self.block_synchronizer.clone(),
            foreign_chains,
            consumers: self.scheduler.consumers,
            storage: self.storage.clone(),
        })
    }

    /// Sample configuration written by `--print-config-template`.
    pub fn template() -> Self {
        let mut foreign_chains = BTreeMap::new();
        foreign_chains.insert(
            "ethereum".to_string(),
            ForeignChainSettings {
                family: ChainFamily::Evm,
                rpc_url: "${ETHEREUM_RPC_URL}".to_string(),
                contract_address: format!("{:?}", EthAddress::zero()),
                private_key_env: Some("ETHEREUM_PRIVATE_KEY".to_string()),
                wallet_address: None,
                min_gas_price: default_min_gas_price(),
                max_gas_price: default_max_gas_price(),
                balance_warning_threshold: default_balance_warning_threshold(),
                balance_error_threshold: default_balance_error_threshold(),
                native_decimals: default_native_decimals(),
                fcd_keys: vec![FcdKeyConfig {
                    key: "ETH-USD".to_string(),
                    value_type: FcdValueType::Numeric,
                }],
                transaction_timeout_secs: default_transaction_timeout_secs(),
                receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
                dispatcher_cooldown_secs: default_dispatcher_cooldown_secs(),
                dispatcher_architecture_version: default_dispatcher_architecture_version(),
            },
        );
        Self {
            metrics_port: 9184,
            home_chain: HomeChainSettings {
                chain_id: "bsc".to_string(),
                rpc_url: "${HOME_CHAIN_RPC_URL}".to_string(),
                registry_address: format!("{:?}", EthAddress::zero()),
                rescan_depth: default_rescan_depth(),
                max_block_range: default_max_block_range(),
                fcd_keys: vec!["ETH-USD".to_string()],
                max_retry_secs: default_max_retry_secs(),
            },
            foreign_chains,
            block_synchronizer: BlockSynchronizerSettings::default(),
            scheduler: SchedulerSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

fn config_err(msg: impl Into<String>) -> SyncError {
    SyncError::Config(msg.into())
}

fn validate_schedule(chain_id: &str, schedule: &JobSchedule) -> SyncResult<()> {
    if schedule.interval_ms == 0 || schedule.lock_ttl_ms == 0 {
        return Err(config_err(format!(
            "{}: interval-ms and lock-ttl-ms must be positive",
            chain_id
        )));
    }
    Ok(())
}

fn validate_rpc_url(chain_id: &str, rpc_url: &str) -> SyncResult<()> {
    if rpc_url.is_empty() {
        return Err(config_err(format!("{}: rpc-url is empty", chain_id)));
    }
    url::Url::parse(rpc_url)
        .map_err(|e| config_err(format!("{}: invalid rpc-url {}: {}", chain_id, rpc_url, e)))?;
    Ok(())
}

fn parse_address(chain_id: &str, field: &str, value: &str) -> SyncResult<EthAddress> {
    EthAddress::from_str(value)
        .map_err(|e| config_err(format!("{}: invalid {} {}: {}", chain_id, field, value, e)))
}

fn parse_amount(chain_id: &str, value: &str, decimals: u32) -> SyncResult<U256> {
    parse_units(value, decimals)
        .map(Into::into)
        .map_err(|e| config_err(format!("{}: invalid amount {}: {}", chain_id, value, e)))
}
