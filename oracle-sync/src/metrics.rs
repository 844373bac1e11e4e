// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, HistogramVec, IntCounterVec, IntGaugeVec,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

pub const METRICS_PATH: &str = "/metrics";

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10., 20., 30., 60., 120., 300.,
];

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_errors: IntCounterVec,

    pub(crate) blocks_discovered: IntCounterVec,
    pub(crate) blocks_finalized: IntCounterVec,
    pub(crate) blocks_failed: IntCounterVec,
    pub(crate) blocks_reverted: IntCounterVec,
    pub(crate) blocks_corrupted: IntCounterVec,
    pub(crate) last_scanned_anchor: IntGaugeVec,

    pub(crate) validator_requests: IntCounterVec,

    pub(crate) replications_ok: IntCounterVec,
    pub(crate) replications_failed: IntCounterVec,
    pub(crate) replications_skipped: IntCounterVec,
    pub(crate) tx_timeouts: IntCounterVec,
    pub(crate) nonce_retries: IntCounterVec,
    pub(crate) wallet_balance: IntGaugeVec,

    pub(crate) job_executions: IntCounterVec,
    pub(crate) job_stale_discards: IntCounterVec,
    pub(crate) job_lock_misses: IntCounterVec,
    pub(crate) job_errors: IntCounterVec,
    pub(crate) job_latency: HistogramVec,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_queries: register_int_counter_vec_with_registry!(
                "oracle_sync_rpc_queries",
                "Total number of chain rpc queries",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            rpc_errors: register_int_counter_vec_with_registry!(
                "oracle_sync_rpc_errors",
                "Total number of failed chain rpc queries",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            blocks_discovered: register_int_counter_vec_with_registry!(
                "oracle_sync_blocks_discovered",
                "Total number of newly minted blocks inserted as completed",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_finalized: register_int_counter_vec_with_registry!(
                "oracle_sync_blocks_finalized",
                "Total number of blocks whose leaves matched the consensus root",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_failed: register_int_counter_vec_with_registry!(
                "oracle_sync_blocks_failed",
                "Total number of blocks whose leaves never matched the consensus root",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_reverted: register_int_counter_vec_with_registry!(
                "oracle_sync_blocks_reverted",
                "Total number of local blocks or replication records deleted after a revert",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_corrupted: register_int_counter_vec_with_registry!(
                "oracle_sync_blocks_corrupted",
                "Total number of blocks deleted because required fields were missing",
                &["chain"],
                registry,
            )
            .unwrap(),
            last_scanned_anchor: register_int_gauge_vec_with_registry!(
                "oracle_sync_last_scanned_anchor",
                "Last home chain height scanned for mint events",
                &["chain"],
                registry,
            )
            .unwrap(),
            validator_requests: register_int_counter_vec_with_registry!(
                "oracle_sync_validator_requests",
                "Validator leaf requests by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            replications_ok: register_int_counter_vec_with_registry!(
                "oracle_sync_replications_ok",
                "Total number of blocks replicated to a foreign chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            replications_failed: register_int_counter_vec_with_registry!(
                "oracle_sync_replications_failed",
                "Total number of failed replication attempts",
                &["chain", "error_type"],
                registry,
            )
            .unwrap(),
            replications_skipped: register_int_counter_vec_with_registry!(
                "oracle_sync_replications_skipped",
                "Replication cycles skipped, by reason",
                &["chain", "reason"],
                registry,
            )
            .unwrap(),
            tx_timeouts: register_int_counter_vec_with_registry!(
                "oracle_sync_tx_timeouts",
                "Total number of transactions without receipt before the timeout",
                &["chain"],
                registry,
            )
            .unwrap(),
            nonce_retries: register_int_counter_vec_with_registry!(
                "oracle_sync_nonce_retries",
                "Total number of submissions retried after a nonce conflict",
                &["chain"],
                registry,
            )
            .unwrap(),
            wallet_balance: register_int_gauge_vec_with_registry!(
                "oracle_sync_wallet_balance_gwei",
                "Replicator wallet balance in gwei",
                &["chain"],
                registry,
            )
            .unwrap(),
            job_executions: register_int_counter_vec_with_registry!(
                "oracle_sync_job_executions",
                "Total number of executed jobs",
                &["chain"],
                registry,
            )
            .unwrap(),
            job_stale_discards: register_int_counter_vec_with_registry!(
                "oracle_sync_job_stale_discards",
                "Total number of jobs discarded because they were older than their interval",
                &["chain"],
                registry,
            )
            .unwrap(),
            job_lock_misses: register_int_counter_vec_with_registry!(
                "oracle_sync_job_lock_misses",
                "Total number of jobs skipped because the chain lock was held",
                &["chain"],
                registry,
            )
            .unwrap(),
            job_errors: register_int_counter_vec_with_registry!(
                "oracle_sync_job_errors",
                "Total number of jobs that ended with an error",
                &["chain", "error_type"],
                registry,
            )
            .unwrap(),
            job_latency: register_histogram_vec_with_registry!(
                "oracle_sync_job_latency",
                "Job execution latency in seconds",
                &["chain"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serves `registry` in the Prometheus text format on `METRICS_PATH`.
pub fn run_metrics_server(socket_address: SocketAddr, registry: Registry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind metrics server on {}: {}", socket_address, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, make_metrics_router(registry)).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    })
}

pub(crate) fn make_metrics_router(registry: Registry) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = vec![];
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered_once() {
        let registry = Registry::new();
        let metrics = SyncMetrics::new(&registry);
        metrics.blocks_discovered.with_label_values(&["bsc"]).inc();
        metrics
            .replications_failed
            .with_label_values(&["ethereum", "tx_timeout"])
            .inc();
        let names: Vec<_> = registry
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"oracle_sync_blocks_discovered".to_string()));
        assert!(names.contains(&"oracle_sync_replications_failed".to_string()));
    }

    #[test]
    #[should_panic]
    fn test_duplicate_registration_panics() {
        let registry = Registry::new();
        let _first = SyncMetrics::new(&registry);
        let _second = SyncMetrics::new(&registry);
    }

    #[tokio::test]
    async fn test_metrics_route_serves_registry() {
        let registry = Registry::new();
        let metrics = SyncMetrics::new(&registry);
        metrics.job_executions.with_label_values(&["bsc"]).inc();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, make_metrics_router(registry))
                .await
                .unwrap()
        });

        let body = reqwest::get(format!("http://{}{}", address, METRICS_PATH))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("oracle_sync_job_executions{chain=\"bsc\"} 1"));
    }
}
