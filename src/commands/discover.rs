use std::sync::Arc;

use anyhow::Context;

use autopol::bus::PublishBus;
use autopol::config::Config;
use autopol::ingest::{FlowLogSource, RawFlow, RawSysEvent, SysLogSource};
use autopol::resolver::KubeClientProvider;
use autopol::store::{InMemoryPolicyStore, PolicyQuery};
use autopol::types::{PolicyBody, PolicyKind};
use autopol::worker::DiscoveryWorker;

/// Placeholder log sources: the concrete Hubble/KubeArmor transport
/// adapters are supplied by the deployment (§6 consumed contract); this
/// in-memory stand-in lets `discover`/`policy` exercise the full pipeline
/// without one wired up.
struct EmptyFlowSource;

#[async_trait::async_trait]
impl FlowLogSource for EmptyFlowSource {
    async fn query_range(&self, _from_millis: i64, _to_millis: i64) -> anyhow::Result<Vec<RawFlow>> {
        Ok(Vec::new())
    }
}

struct EmptySysSource;

#[async_trait::async_trait]
impl SysLogSource for EmptySysSource {
    async fn query_range(&self, _from_millis: i64, _to_millis: i64) -> anyhow::Result<Vec<RawSysEvent>> {
        Ok(Vec::new())
    }
}

/// Run exactly one discovery tick against `cluster` and return the
/// resulting policy store. Shared by `discover` (prints a summary) and
/// `policy` (the CLI's only way to inspect the store, since C6's
/// in-memory backing doesn't outlive a process — see DESIGN.md).
pub async fn run_once(cluster: &str, config: Config) -> anyhow::Result<Arc<InMemoryPolicyStore>> {
    let mut provider = KubeClientProvider::new();
    provider.client_for(cluster).await.context("failed to build Kubernetes client for cluster")?;

    let now = now_millis();
    let raw_flows = EmptyFlowSource.query_range(now - 3_600_000, now).await?;
    let raw_sys_events = EmptySysSource.query_range(now - 3_600_000, now).await?;

    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(config.fanout_queue_depth, config.fanout_enqueue_timeout_ms));
    let worker = DiscoveryWorker::new(cluster, config, Arc::new(provider), store.clone(), bus);

    for flow in &raw_flows {
        worker.ingest_flow(flow, now).await;
    }
    for event in &raw_sys_events {
        worker.ingest_sys_event(event, now).await;
    }

    worker.trigger_now().await;

    if let Some(err) = &worker.status().await.last_error {
        println!("Discovery tick reported an error: {err}\n");
    }

    Ok(store)
}

pub async fn run(cluster: &str, config_path: Option<&str>) -> anyhow::Result<()> {
    println!("Running a one-shot discovery pass against cluster '{cluster}'...\n");

    let config = load_config(config_path)?;
    let store = run_once(cluster, config).await?;

    let policies = store
        .query(&PolicyQuery { cluster: Some(cluster.to_string()), ..Default::default() })
        .await?;

    println!("Synthesized {} policies:\n", policies.len());
    println!("{:<40} {:<10} {:<20} PEER", "NAME", "KIND", "NAMESPACE");
    println!("{}", "-".repeat(90));
    for policy in &policies {
        let kind = match policy.kind {
            PolicyKind::Network => "network",
            PolicyKind::System => "system",
        };
        let peer = match &policy.spec {
            PolicyBody::Network(rs) => rs.peer.peer_key(),
            PolicyBody::System(rs) => format!("from:{}", rs.from_source),
        };
        println!("{:<40} {:<10} {:<20} {}", policy.name, kind, policy.namespace, peer);
    }

    Ok(())
}

pub(crate) fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path) => Config::from_file(std::path::Path::new(path))
            .with_context(|| format!("failed to load config from {path}")),
        None => Ok(Config::default()),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
