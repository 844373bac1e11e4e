// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract incarnations of a chain and which one was authoritative when.

use crate::error::{SyncError, SyncResult};
use crate::home_chain::HomeChain;
use oracle_sync_schema::{
    last_block_checked_for_new_contract, ChainInstance, MappingStore, OracleStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// Instance whose anchor is the largest one not above `anchor`; ties go to
/// the larger blocks count offset.
pub fn resolve_in(instances: &[ChainInstance], anchor: u64) -> Option<ChainInstance> {
    instances
        .iter()
        .filter(|i| i.anchor <= anchor)
        .max_by_key(|i| (i.anchor, i.blocks_count_offset))
        .cloned()
}

/// One instance per contract address, newest first.
pub fn unique_instances(mut instances: Vec<ChainInstance>) -> Vec<ChainInstance> {
    instances.sort_by(|a, b| {
        (b.anchor, b.blocks_count_offset).cmp(&(a.anchor, a.blocks_count_offset))
    });
    let mut seen = HashSet::new();
    instances.retain(|i| seen.insert(i.address.to_lowercase()));
    instances
}

pub struct ChainInstanceResolver {
    store: Arc<dyn OracleStore>,
}

impl ChainInstanceResolver {
    pub fn new(store: Arc<dyn OracleStore>) -> Self {
        Self { store }
    }

    /// Resolves every anchor. An anchor older than all known instances
    /// resolves to `None`, which points at a gap in contract detection.
    pub async fn resolve_by_anchor(
        &self,
        chain_id: &str,
        anchors: &[u64],
    ) -> SyncResult<Vec<Option<ChainInstance>>> {
        let instances = self.store.chain_instances(chain_id).await?;
        Ok(anchors
            .iter()
            .map(|anchor| {
                let resolved = resolve_in(&instances, *anchor);
                if resolved.is_none() {
                    error!(
                        "[ChainInstanceResolver][{}] No chain instance for anchor {}",
                        chain_id, anchor
                    );
                }
                resolved
            })
            .collect())
    }

    /// Contracts that may hold events emitted in `[from, to]`.
    pub async fn instances_in_range(
        &self,
        chain_id: &str,
        from: u64,
        to: u64,
    ) -> SyncResult<Vec<ChainInstance>> {
        let instances = self.store.chain_instances(chain_id).await?;
        let mut active: Vec<ChainInstance> = instances
            .iter()
            .filter(|i| i.anchor > from && i.anchor <= to)
            .cloned()
            .collect();
        match resolve_in(&instances, from) {
            Some(instance) => active.push(instance),
            None => {
                if active.is_empty() {
                    error!(
                        "[ChainInstanceResolver][{}] No chain instance for range [{}, {}]",
                        chain_id, from, to
                    );
                }
            }
        }
        Ok(unique_instances(active))
    }
}

/// Appends a chain instance whenever the registry points to a new contract.
pub struct ChainInstanceDetector {
    home: Arc<dyn HomeChain>,
    store: Arc<dyn OracleStore>,
    mapping: Arc<dyn MappingStore>,
}

impl ChainInstanceDetector {
    pub fn new(
        home: Arc<dyn HomeChain>,
        store: Arc<dyn OracleStore>,
        mapping: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            home,
            store,
            mapping,
        }
    }

    /// Returns the instance that was added, if any.
    pub async fn apply(&self) -> SyncResult<Option<ChainInstance>> {
        let chain_id = self.home.chain_id().to_string();
        let address = self
            .home
            .registry_chain_address()
            .await?
            .ok_or_else(|| SyncError::MissingRegistry(chain_id.clone()))?;
        let block_number = self.home.block_number().await?;

        let known = self.store.chain_instances(&chain_id).await?;
        let added = if known
            .iter()
            .any(|i| i.address.eq_ignore_ascii_case(&address))
        {
            None
        } else {
            let instance = ChainInstance {
                chain_id: chain_id.clone(),
                blocks_count_offset: self.home.blocks_count_offset(&address).await?,
                address,
                anchor: block_number,
            };
            self.store.insert_chain_instance(instance.clone()).await?;
            info!(
                "[ChainInstanceDetector][{}] New chain contract {} at anchor {} (offset {})",
                chain_id, instance.address, instance.anchor, instance.blocks_count_offset
            );
            Some(instance)
        };
        self.mapping
            .set(
                &last_block_checked_for_new_contract(&chain_id),
                block_number.to_string(),
            )
            .await?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHomeChain;
    use oracle_sync_schema::InMemoryStore;

    fn instance(address: &str, anchor: u64, offset: u64) -> ChainInstance {
        ChainInstance {
            chain_id: "bsc".to_string(),
            address: address.to_string(),
            anchor,
            blocks_count_offset: offset,
        }
    }

    #[test]
    fn test_resolve_picks_latest_anchor_not_above_query() {
        let instances = vec![instance("0xa", 10, 0), instance("0xb", 100, 3), instance("0xc", 200, 7)];
        assert_eq!(resolve_in(&instances, 9), None);
        assert_eq!(resolve_in(&instances, 10).unwrap().address, "0xa");
        assert_eq!(resolve_in(&instances, 199).unwrap().address, "0xb");
        assert_eq!(resolve_in(&instances, 5000).unwrap().address, "0xc");
    }

    #[test]
    fn test_resolve_tie_break_by_offset() {
        let instances = vec![instance("0xa", 100, 5), instance("0xb", 100, 9)];
        let resolved = resolve_in(&instances, 150).unwrap();
        assert_eq!(resolved.blocks_count_offset, 9);
        assert_eq!(resolved.address, "0xb");
    }

    #[test]
    fn test_unique_instances() {
        let unique = unique_instances(vec![
            instance("0xA", 10, 0),
            instance("0xb", 100, 3),
            instance("0xa", 300, 9),
            instance("0xc", 200, 7),
        ]);
        let summary: Vec<_> = unique.iter().map(|i| (i.address.as_str(), i.anchor)).collect();
        assert_eq!(summary, vec![("0xa", 300), ("0xc", 200), ("0xb", 100)]);
    }

    #[tokio::test]
    async fn test_resolve_by_anchor_reports_gaps() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_chain_instance(instance("0xa", 100, 5)).await.unwrap();
        store.insert_chain_instance(instance("0xb", 100, 9)).await.unwrap();
        let resolver = ChainInstanceResolver::new(store);
        let resolved = resolver.resolve_by_anchor("bsc", &[50, 150]).await.unwrap();
        assert!(resolved[0].is_none());
        assert_eq!(resolved[1].as_ref().unwrap().address, "0xb");
    }

    #[tokio::test]
    async fn test_instances_in_range_spans_upgrades() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_chain_instance(instance("0xa", 10, 0)).await.unwrap();
        store.insert_chain_instance(instance("0xb", 100, 3)).await.unwrap();
        store.insert_chain_instance(instance("0xc", 200, 7)).await.unwrap();
        let resolver = ChainInstanceResolver::new(store);
        let addresses = |v: Vec<ChainInstance>| v.into_iter().map(|i| i.address).collect::<Vec<_>>();
        assert_eq!(addresses(resolver.instances_in_range("bsc", 50, 150).await.unwrap()), vec!["0xb", "0xa"]);
        assert_eq!(addresses(resolver.instances_in_range("bsc", 100, 150).await.unwrap()), vec!["0xb"]);
        assert!(resolver.instances_in_range("bsc", 1, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detector_appends_new_contract_once() {
        let store = Arc::new(InMemoryStore::new());
        let home = FakeHomeChain::new("bsc");
        home.set_block_number(500);
        home.set_registry_address(Some("0x00000000000000000000000000000000000000c1"));
        home.set_blocks_count_offset(12);
        let detector = ChainInstanceDetector::new(Arc::new(home.clone()), store.clone(), store.clone());

        let added = detector.apply().await.unwrap().unwrap();
        assert_eq!(added.anchor, 500);
        assert_eq!(added.blocks_count_offset, 12);
        assert!(detector.apply().await.unwrap().is_none());
        assert_eq!(store.chain_instances("bsc").await.unwrap().len(), 1);
        assert_eq!(
            store
                .get(&last_block_checked_for_new_contract("bsc"))
                .await
                .unwrap()
                .as_deref(),
            Some("500")
        );

        home.set_registry_address(None);
        assert!(matches!(detector.apply().await, Err(SyncError::MissingRegistry(_))));
    }
}
