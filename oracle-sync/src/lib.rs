// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod batch_range;
pub mod block_synchronizer;
pub mod chain_instance;
pub mod config;
pub mod error;
pub mod foreign;
pub mod gas_estimator;
pub mod home_chain;
pub mod leaves_synchronizer;
pub mod merkle;
pub mod metrics;
pub mod new_blocks_resolver;
pub mod node;
pub mod reverted_block_resolver;
pub mod rpc;
pub mod tx_sender;
pub mod types;
pub mod utils;
pub mod validator_client;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

/// Retries `$func` while it fails with a transient `SyncError`, for at most
/// `$max_elapsed_time`. Permanent errors are returned on the first attempt.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 51.2, 102.4, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() => {
                        tracing::debug!("Retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
