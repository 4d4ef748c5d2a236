use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tokio::signal;
use tracing::info;

use autopol::bus::PublishBus;
use autopol::config::Config;
use autopol::resolver::KubeClientProvider;
use autopol::store::{InMemoryPolicyStore, PolicyQuery, PolicyStore};
use autopol::worker::{self, DiscoveryWorker};

use super::discover::load_config;

#[derive(Clone)]
struct ServeState {
    worker: Arc<DiscoveryWorker>,
    store: Arc<InMemoryPolicyStore>,
}

/// Run the discovery worker continuously alongside an HTTP control plane
/// (healthz/readyz/metrics/status, mirroring the watch controller's
/// endpoint set, plus a manual-trigger verb for operators).
pub async fn run(cluster: &str, config_path: Option<&str>, addr_str: &str) -> Result<()> {
    println!("Starting discovery worker for cluster '{cluster}'...\n");
    info!(cluster = %cluster, "worker_starting");

    let config = load_config(config_path)?;

    print!("  Kubeconfig ................... ");
    let mut provider = KubeClientProvider::new();
    match provider.client_for(cluster).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot build Kubernetes client for cluster '{cluster}': {e}");
        }
    }

    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(config.fanout_queue_depth, config.fanout_enqueue_timeout_ms));
    let worker = Arc::new(DiscoveryWorker::new(
        cluster,
        config,
        Arc::new(provider),
        store.clone(),
        bus,
    ));

    let addr: SocketAddr = addr_str.parse().context("invalid --addr")?;
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET  /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET  /readyz ............... Readiness probe (200 once the first tick has run)");
    println!("    GET  /metrics .............. Prometheus metrics scrape endpoint");
    println!("    GET  /status ............... Worker state as JSON");
    println!("    POST /trigger .............. Run one discovery tick immediately");
    println!();
    println!("Discovery worker running. Press Ctrl+C to stop.\n");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_run = worker.clone();
    let worker_shutdown = shutdown_tx.subscribe();
    let worker_handle = tokio::spawn(async move { worker_run.run(worker_shutdown).await });

    let state = ServeState { worker: worker.clone(), store };
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_http_server(state, http_shutdown, addr).await });

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Stopping discovery worker...");

    let _ = shutdown_tx.send(());
    let _ = worker_handle.await?;
    let _ = http_handle.await?;

    info!("worker_stopped");
    println!("Discovery worker stopped.");
    Ok(())
}

pub(crate) fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/trigger", post(trigger_handler))
        .with_state(state)
}

async fn start_http_server(state: ServeState, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn ready_handler(State(state): State<ServeState>) -> impl IntoResponse {
    let status = state.worker.status().await;
    if status.tick_count > 0 {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn status_handler(State(state): State<ServeState>) -> impl IntoResponse {
    let status = state.worker.status().await;
    let policies = state
        .store
        .query(&PolicyQuery::default())
        .await
        .unwrap_or_default();
    let body = serde_json::json!({
        "state": format!("{:?}", status.state),
        "tickCount": status.tick_count,
        "lastTickStartedAt": status.last_tick_started_at,
        "lastTickCompletedAt": status.last_tick_completed_at,
        "lastTickDurationMs": status.last_tick_duration_ms,
        "lastError": status.last_error,
        "policiesStored": policies.len(),
        "lastTickPoliciesDiscovered": status.last_tick_policies_discovered,
        "lastTickPoliciesSuperseded": status.last_tick_policies_superseded,
    });
    (StatusCode::OK, axum::Json(body))
}

async fn trigger_handler(State(state): State<ServeState>) -> impl IntoResponse {
    state.worker.trigger_now().await;
    (StatusCode::ACCEPTED, "triggered")
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = worker::registry().gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}
