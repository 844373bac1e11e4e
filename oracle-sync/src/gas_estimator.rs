// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::SyncResult;
use crate::rpc::ChainRpc;
use crate::types::TxOverrides;
use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

/// Used when the node does not answer `eth_maxPriorityFeePerGas`.
const DEFAULT_PRIORITY_FEE: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimate {
    /// Statistics over the gas prices paid in the latest block.
    pub min: u64,
    pub max: u64,
    pub avg: u64,
    /// Recommended gas price, always within the configured bounds.
    pub gas_price: u64,
    /// Gas price suggested by the node itself.
    pub network_gas_price: u64,
    pub is_tx_type2: bool,
    pub max_priority_fee_per_gas: Option<u64>,
    pub max_fee_per_gas: Option<u64>,
}

impl GasEstimate {
    /// Fee fields for a transaction built from this estimate.
    pub fn overrides(&self) -> TxOverrides {
        if self.is_tx_type2 {
            TxOverrides {
                max_fee_per_gas: self.max_fee_per_gas.map(U256::from),
                max_priority_fee_per_gas: self.max_priority_fee_per_gas.map(U256::from),
                ..Default::default()
            }
        } else {
            TxOverrides {
                gas_price: Some(U256::from(self.gas_price)),
                ..Default::default()
            }
        }
    }

    /// Price used to push out a stuck transaction.
    pub fn cancellation_gas_price(&self) -> u64 {
        self.gas_price
            .max(self.network_gas_price)
            .max(self.max_fee_per_gas.unwrap_or_default())
            .saturating_mul(2)
    }
}

/// Median of the cheapest 90% of `prices` that are at or above `floor`,
/// clamped to `[floor, ceiling]`.
pub fn custom_estimate(prices: &[u64], floor: u64, ceiling: u64) -> u64 {
    let mut sorted = prices.to_vec();
    sorted.sort_unstable();
    let keep = (sorted.len() * 9 / 10).max(1).min(sorted.len());
    let filtered: Vec<u64> = sorted[..keep].iter().copied().filter(|p| *p >= floor).collect();
    let median = match filtered.len() {
        0 => floor,
        n if n % 2 == 1 => filtered[n / 2],
        n => {
            let (a, b) = (filtered[n / 2 - 1], filtered[n / 2]);
            a / 2 + b / 2 + (a % 2 + b % 2) / 2
        }
    };
    median.max(floor).min(ceiling)
}

pub struct GasEstimator {
    chain_id: String,
    rpc: Arc<dyn ChainRpc>,
}

impl GasEstimator {
    pub fn new(chain_id: String, rpc: Arc<dyn ChainRpc>) -> Self {
        Self { chain_id, rpc }
    }

    pub async fn apply(&self, min_gas_price: u64, max_gas_price: u64) -> SyncResult<GasEstimate> {
        let (fees, network_gas_price) =
            futures::try_join!(self.rpc.latest_block_fees(), self.rpc.gas_price())?;

        let prices = &fees.gas_prices;
        let (min, max, avg) = if prices.is_empty() {
            (network_gas_price, network_gas_price, network_gas_price)
        } else {
            let sum: u128 = prices.iter().map(|p| *p as u128).sum();
            (
                *prices.iter().min().unwrap_or(&0),
                *prices.iter().max().unwrap_or(&0),
                (sum / prices.len() as u128) as u64,
            )
        };

        let estimate = match fees.base_fee_per_gas {
            Some(base_fee) => {
                let priority = match self.rpc.max_priority_fee_per_gas().await {
                    Ok(fee) => fee,
                    Err(e) => {
                        warn!(
                            "[GasEstimator][{}] Priority fee unavailable, using default: {:?}",
                            self.chain_id, e
                        );
                        DEFAULT_PRIORITY_FEE
                    }
                };
                let max_fee = base_fee
                    .saturating_mul(2)
                    .saturating_add(priority)
                    .min(max_gas_price);
                GasEstimate {
                    min,
                    max,
                    avg,
                    gas_price: base_fee.max(min_gas_price).min(max_gas_price),
                    network_gas_price,
                    is_tx_type2: true,
                    max_priority_fee_per_gas: Some(priority.min(max_fee)),
                    max_fee_per_gas: Some(max_fee),
                }
            }
            None => {
                let gas_price = if prices.is_empty() {
                    network_gas_price.max(min_gas_price).min(max_gas_price)
                } else {
                    custom_estimate(prices, min_gas_price, max_gas_price)
                };
                GasEstimate {
                    min,
                    max,
                    avg,
                    gas_price,
                    network_gas_price,
                    is_tx_type2: false,
                    max_priority_fee_per_gas: None,
                    max_fee_per_gas: None,
                }
            }
        };
        debug!("[GasEstimator][{}] {:?}", self.chain_id, estimate);
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LatestBlockFees;
    use crate::test_utils::FakeChainRpc;

    #[test]
    fn test_custom_estimate_trims_spikes() {
        let mut prices = vec![10; 9];
        prices.push(1_000);
        assert_eq!(custom_estimate(&prices, 1, 10_000), 10);

        // odd count median
        assert_eq!(custom_estimate(&[5, 7, 9, 11, 13, 15, 17, 19, 21, 900], 1, 1_000), 13);
    }

    #[test]
    fn test_custom_estimate_ignores_prices_below_floor() {
        assert_eq!(custom_estimate(&[1, 2, 3, 50, 60, 70], 40, 1_000), 55);
        assert_eq!(custom_estimate(&[1, 2, 3], 40, 1_000), 40);
        assert_eq!(custom_estimate(&[], 40, 1_000), 40);
    }

    #[test]
    fn test_custom_estimate_respects_bounds() {
        let distributions: Vec<Vec<u64>> = vec![
            vec![],
            vec![0],
            vec![u64::MAX; 3],
            (0..100).collect(),
            (0..100).map(|i| i * i * 1_000).collect(),
            vec![1, u64::MAX],
        ];
        for (floor, ceiling) in [(0, 10), (50, 60), (1_000, 1_000), (7, u64::MAX)] {
            for prices in &distributions {
                let estimate = custom_estimate(prices, floor, ceiling);
                assert!(
                    estimate >= floor && estimate <= ceiling,
                    "{} outside [{}, {}] for {:?}",
                    estimate,
                    floor,
                    ceiling,
                    prices
                );
            }
        }
    }

    #[tokio::test]
    async fn test_type2_estimate() {
        let rpc = FakeChainRpc::default();
        rpc.set_fees(LatestBlockFees {
            gas_prices: vec![30, 40],
            base_fee_per_gas: Some(100),
        });
        rpc.set_priority_fee(5);
        let estimator = GasEstimator::new("ethereum".into(), Arc::new(rpc.clone()));

        let estimate = estimator.apply(10, 1_000).await.unwrap();
        assert!(estimate.is_tx_type2);
        assert_eq!(estimate.gas_price, 100);
        assert_eq!(estimate.max_fee_per_gas, Some(205));
        assert_eq!(estimate.max_priority_fee_per_gas, Some(5));

        // ceiling caps both the price and the max fee
        let estimate = estimator.apply(10, 150).await.unwrap();
        assert_eq!(estimate.gas_price, 100);
        assert_eq!(estimate.max_fee_per_gas, Some(150));

        let estimate = estimator.apply(120, 1_000).await.unwrap();
        assert_eq!(estimate.gas_price, 120);
    }

    #[tokio::test]
    async fn test_legacy_estimate() {
        let rpc = FakeChainRpc::default();
        rpc.set_fees(LatestBlockFees {
            gas_prices: vec![20, 30, 40, 10_000],
            base_fee_per_gas: None,
        });
        rpc.set_gas_price(25);
        let estimator = GasEstimator::new("bsc".into(), Arc::new(rpc));
        let estimate = estimator.apply(10, 1_000).await.unwrap();
        assert!(!estimate.is_tx_type2);
        assert_eq!(estimate.gas_price, 30);
        assert_eq!(estimate.min, 20);
        assert_eq!(estimate.max, 10_000);
        assert_eq!(estimate.network_gas_price, 25);
        assert_eq!(estimate.overrides().gas_price, Some(U256::from(30)));
        assert_eq!(estimate.cancellation_gas_price(), 60);
    }
}
