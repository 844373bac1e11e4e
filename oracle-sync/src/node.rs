// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::block_synchronizer::BlockSynchronizer;
use crate::chain_instance::ChainInstanceDetector;
use crate::config::{
    ChainFamily, StorageBackend, StorageSettings, ValidatedConfig, ValidatedForeignChain,
};
use crate::error::SyncResult;
use crate::foreign::{
    CooldownPolicy, EvmForeignChain, ForeignChainContract, ForeignChainReplicator,
    JsonRpcForeignChain, ReplicationOutcome,
};
use crate::home_chain::{EvmHomeChain, HomeChain};
use crate::leaves_synchronizer::LeavesSynchronizer;
use crate::metrics::SyncMetrics;
use crate::new_blocks_resolver::{NewBlocksResolver, NewBlocksResolverConfig};
use crate::rpc::{ChainRpc, MiddlewareRpc};
use crate::utils::get_eth_signer_client;
use crate::validator_client::{HttpValidatorClient, ValidatorClient};
use crate::worker::{
    DistributedLock, InMemoryJobQueue, InMemoryLock, Job, JobHandler, PgLock, Scheduler,
    SingletonWorker,
};
use anyhow::Context;
use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use oracle_sync_schema::{InMemoryStore, MappingStore, OracleStore, PgStore};
use prometheus::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One home chain cycle: pick up registry changes, verify known blocks, then
/// scan for new ones. Scanning is skipped when verification found a revert.
pub struct HomeChainHandle {
    detector: ChainInstanceDetector,
    synchronizer: BlockSynchronizer,
    resolver: NewBlocksResolver,
}

#[async_trait]
impl JobHandler for HomeChainHandle {
    async fn handle(&self, job: &Job) -> SyncResult<()> {
        if let Some(instance) = self.detector.apply().await? {
            info!(
                "[HomeChain][{}] Tracking chain contract {}",
                job.chain_id, instance.address
            );
        }
        let report = self.synchronizer.apply().await?;
        if report.aborted() {
            warn!(
                "[HomeChain][{}] Synchronization aborted ({:?}), skipping block discovery",
                job.chain_id, report
            );
            return Ok(());
        }
        let scan = self.resolver.apply().await?;
        info!(
            "[HomeChain][{}] Cycle done: {} finalized, {} failed, {} new blocks",
            job.chain_id,
            report.finalized,
            report.failed,
            scan.inserted
        );
        Ok(())
    }
}

pub struct ForeignChainHandle {
    replicator: ForeignChainReplicator,
}

#[async_trait]
impl JobHandler for ForeignChainHandle {
    async fn handle(&self, _job: &Job) -> SyncResult<()> {
        let chain_id = self.replicator.chain_id();
        match self.replicator.apply().await? {
            ReplicationOutcome::Replicated(blocks) => {
                info!("[ForeignChain][{}] Replicated blocks {:?}", chain_id, blocks)
            }
            ReplicationOutcome::Failed(errors) => {
                warn!("[ForeignChain][{}] Replication failed: {:?}", chain_id, errors)
            }
            outcome => info!("[ForeignChain][{}] {:?}", chain_id, outcome),
        }
        Ok(())
    }
}

/// Builds every chain handle once and starts the scheduler. The returned
/// tasks finish after `cancel` fires.
pub async fn run_sync_node(
    config: ValidatedConfig,
    registry: &Registry,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let metrics = Arc::new(SyncMetrics::new(registry));
    let Storage {
        store: oracle_store,
        mapping,
        lock,
    } = build_storage(&config.storage).await?;

    let home_chain_id = config.home_chain.chain_id.clone();
    let home = build_home_chain(&config, metrics.clone())?;
    let validator_client = Arc::new(HttpValidatorClient::new(
        config.block_synchronizer.validator_request_timeout(),
    )?);
    let home_handle = build_home_handle(
        &config,
        home,
        validator_client,
        oracle_store.clone(),
        mapping.clone(),
        metrics.clone(),
    );

    let mut foreign_handles = BTreeMap::new();
    for (chain_id, chain) in &config.foreign_chains {
        let contract = build_foreign_contract(chain, metrics.clone())
            .await
            .with_context(|| format!("Failed to build foreign chain {}", chain_id))?;
        let replicator = ForeignChainReplicator::new(
            chain,
            contract,
            oracle_store.clone(),
            home_chain_id.clone(),
            Arc::new(CooldownPolicy::new(
                chain.settings.dispatcher_cooldown(),
                mapping.clone(),
            )),
            metrics.clone(),
        );
        foreign_handles.insert(chain_id.clone(), ForeignChainHandle { replicator });
    }

    let worker = Arc::new(SingletonWorker::new(lock, metrics.clone()));
    let mut scheduler = Scheduler::new(Arc::new(InMemoryJobQueue::new()), worker);
    scheduler.register(
        home_chain_id,
        config.home_schedule.clone(),
        Arc::new(home_handle),
    );
    for (chain_id, handle) in foreign_handles {
        let schedule = config.foreign_chains[&chain_id].schedule.clone();
        scheduler.register(chain_id, schedule, Arc::new(handle));
    }
    info!("Scheduling chains {:?}", scheduler.chains());
    Ok(scheduler.run(config.consumers, cancel))
}

struct Storage {
    store: Arc<dyn OracleStore>,
    mapping: Arc<dyn MappingStore>,
    lock: Arc<dyn DistributedLock>,
}

async fn build_storage(settings: &StorageSettings) -> anyhow::Result<Storage> {
    match settings.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage, records and locks are not shared or persisted");
            let store = Arc::new(InMemoryStore::new());
            Ok(Storage {
                store: store.clone(),
                mapping: store,
                lock: Arc::new(InMemoryLock::new()),
            })
        }
        StorageBackend::Postgres => {
            let database_url = settings
                .database_url
                .as_deref()
                .context("storage database-url is not set")?;
            let store = PgStore::new(
                database_url,
                settings.db_connection_pool_size,
                settings.connection_timeout(),
            )
            .await
            .context("Failed to connect to the database")?;
            store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
            info!("Using postgres storage");
            Ok(Storage {
                store: Arc::new(store.clone()),
                mapping: Arc::new(store.clone()),
                lock: Arc::new(PgLock::new(store)),
            })
        }
    }
}

fn build_home_chain(
    config: &ValidatedConfig,
    metrics: Arc<SyncMetrics>,
) -> anyhow::Result<Arc<dyn HomeChain>> {
    let home = &config.home_chain;
    let provider = Provider::<Http>::try_from(home.rpc_url.as_str())
        .with_context(|| format!("Invalid home chain rpc url {}", home.rpc_url))?
        .interval(Duration::from_millis(2000));
    Ok(Arc::new(EvmHomeChain::new(
        home.chain_id.clone(),
        Arc::new(provider),
        config.home_registry,
        metrics,
    )?))
}

fn build_home_handle(
    config: &ValidatedConfig,
    home: Arc<dyn HomeChain>,
    validator_client: Arc<dyn ValidatorClient>,
    store: Arc<dyn OracleStore>,
    mapping: Arc<dyn MappingStore>,
    metrics: Arc<SyncMetrics>,
) -> HomeChainHandle {
    let settings = &config.home_chain;
    let leaves = LeavesSynchronizer::new(
        settings.chain_id.clone(),
        store.clone(),
        validator_client,
        metrics.clone(),
    );
    HomeChainHandle {
        detector: ChainInstanceDetector::new(home.clone(), store.clone(), mapping.clone()),
        synchronizer: BlockSynchronizer::new(
            home.clone(),
            store.clone(),
            leaves,
            config.block_synchronizer.clone(),
            settings.max_retry_duration(),
            metrics.clone(),
        ),
        resolver: NewBlocksResolver::new(
            home,
            store,
            mapping,
            NewBlocksResolverConfig {
                rescan_depth: settings.rescan_depth,
                max_block_range: settings.max_block_range,
                fcd_keys: settings.fcd_keys.clone(),
            },
            metrics,
        ),
    }
}

async fn build_foreign_contract(
    chain: &ValidatedForeignChain,
    metrics: Arc<SyncMetrics>,
) -> anyhow::Result<Arc<dyn ForeignChainContract>> {
    match chain.settings.family {
        ChainFamily::Evm => {
            let rpc = get_signer_rpc(chain, metrics.clone()).await?;
            Ok(Arc::new(EvmForeignChain::new(chain, rpc, metrics)?))
        }
        ChainFamily::JsonRpc => Ok(Arc::new(JsonRpcForeignChain::new(chain, metrics)?)),
    }
}

async fn get_signer_rpc(
    chain: &ValidatedForeignChain,
    metrics: Arc<SyncMetrics>,
) -> anyhow::Result<Arc<dyn ChainRpc>> {
    let settings = &chain.settings;
    let key_env = settings
        .private_key_env
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("{}: private-key-env is not set", chain.chain_id))?;
    let private_key = std::env::var(key_env)
        .with_context(|| format!("{}: environment variable {} is not set", chain.chain_id, key_env))?;
    let signer = get_eth_signer_client(&settings.rpc_url, &private_key)
        .await
        .with_context(|| format!("{}: failed to build signer client", chain.chain_id))?;
    let sender = signer.address();
    info!("[ForeignChain][{}] Using wallet {:?}", chain.chain_id, sender);
    Ok(Arc::new(MiddlewareRpc::new(
        chain.chain_id.clone(),
        Arc::new(signer),
        sender,
        metrics,
    )))
}
