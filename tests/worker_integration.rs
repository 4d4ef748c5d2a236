mod common;

use std::sync::Arc;

use common::{make_flow, make_sys_event, FixtureProvider};

use autopol::bus::{PublishBus, SubscriptionFilter};
use autopol::config::{Config, OperationMode};
use autopol::store::{InMemoryPolicyStore, PolicyQuery, PolicyStore};
use autopol::worker::{DiscoveryWorker, WorkerState};

// End-to-end C1 -> C2 -> C4/C5 -> C6 -> C7 pipeline driven through the
// worker's public surface, mirroring §4.8's tick orchestration.

fn one_shot_config() -> Config {
    let mut config = Config::default();
    config.operation_mode = OperationMode::OneShot;
    config
}

#[tokio::test]
async fn one_shot_tick_ingests_synthesizes_stores_and_publishes() {
    let provider = FixtureProvider::new().with_pod("api", "default", "10.0.0.9", &[("app", "api")]);
    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(64, 100));
    let mut sub = bus.subscribe(SubscriptionFilter::default()).await;

    let worker = DiscoveryWorker::new("c1", one_shot_config(), Arc::new(provider), store.clone(), bus);

    worker.ingest_flow(&make_flow("10.0.0.1", "web", "10.0.0.9", "api", 8080), 1000).await;
    worker.ingest_sys_event(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/cat"), 1000).await;

    worker.trigger_now().await;

    let status = worker.status().await;
    assert_eq!(status.state, WorkerState::Idle);
    assert_eq!(status.tick_count, 1);
    assert!(status.last_error.is_none());
    assert_eq!(status.last_tick_policies_discovered, 2);
    assert_eq!(status.last_tick_policies_superseded, 0);
    assert!(status.last_tick_duration_ms.is_some());

    let stored = store.query(&PolicyQuery::default()).await.unwrap();
    assert_eq!(stored.len(), 2, "expected one network and one system policy");

    let mut seen = 0;
    while tokio::time::timeout(std::time::Duration::from_millis(20), sub.receiver.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {
        seen += 1;
    }
    assert_eq!(seen, 2, "both synthesized policies should have been published");
}

#[tokio::test]
async fn second_tick_supersedes_a_narrower_network_policy() {
    let provider = FixtureProvider::new().with_pod("api", "default", "10.0.0.9", &[("app", "api")]);
    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(64, 100));

    let worker = DiscoveryWorker::new("c1", one_shot_config(), Arc::new(provider), store.clone(), bus);

    // First pass observes only port 80.
    worker.ingest_flow(&make_flow("10.0.0.1", "web", "10.0.0.9", "api", 80), 1000).await;
    worker.trigger_now().await;
    let first_pass = store.query(&PolicyQuery::default()).await.unwrap();
    assert_eq!(first_pass.len(), 1);
    let first_name = first_pass[0].name.clone();

    // Second pass observes both ports 80 and 443 in the same tick, which
    // synthesizes a wider ruleset than the first pass stored.
    worker.ingest_flow(&make_flow("10.0.0.1", "web", "10.0.0.9", "api", 80), 2000).await;
    worker.ingest_flow(&make_flow("10.0.0.1", "web", "10.0.0.9", "api", 443), 2000).await;
    worker.trigger_now().await;

    let superseded = store.get(&first_name).await.unwrap().unwrap();
    assert_eq!(superseded.status, autopol::types::PolicyStatus::Outdated);
    assert!(superseded.outdated.is_some());

    let latest = store.query(&PolicyQuery { status: Some(autopol::types::PolicyStatus::Latest), ..Default::default() }).await.unwrap();
    assert_eq!(latest.len(), 1);

    let status = worker.status().await;
    assert_eq!(status.last_tick_policies_discovered, 1, "the wider ruleset is a new policy name");
    assert_eq!(status.last_tick_policies_superseded, 1, "the narrower first-pass policy was superseded");
}

#[tokio::test]
async fn dns_resolved_fqdn_attaches_implicit_dns_policy_end_to_end() {
    // Scenario 3 (spec.md §8): a DNS response frame correlates a query to
    // resolved IPs, and a subsequent flow to one of those IPs is classified
    // as an FQDN peer rather than a bare CIDR, through the worker's actual
    // ingest -> tick surface (not `ResourceResolver::record_dns` called
    // directly, as the unit tests in resolver.rs/netpolicy.rs do).
    let provider = FixtureProvider::new().with_pod("web", "default", "10.0.0.1", &[("app", "web")]);
    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(64, 100));
    let worker = DiscoveryWorker::new("c1", one_shot_config(), Arc::new(provider), store.clone(), bus);

    let dns_answer = autopol::ingest::RawFlow {
        direction: Some(autopol::types::Direction::Egress),
        verdict: Some("allow".to_string()),
        src_ip: Some("10.0.0.1".to_string()),
        dst_ip: Some("10.96.0.10".to_string()),
        src_workload: "web".to_string(),
        dst_workload: "kube-dns".to_string(),
        src_namespace: "default".to_string(),
        dst_namespace: "kube-system".to_string(),
        protocol: Some(autopol::types::Protocol::Udp),
        dst_port: 53,
        l7_dns_query: Some("example.com.".to_string()),
        l7_dns_is_request: false,
        l7_dns_response_ips: vec!["93.184.216.34".to_string()],
        ..Default::default()
    };
    worker.ingest_flow(&dns_answer, 1000).await;
    worker.ingest_flow(&make_flow("10.0.0.1", "web", "93.184.216.34", "external", 443), 1000).await;

    worker.trigger_now().await;
    assert!(worker.status().await.last_error.is_none());

    let stored = store.query(&PolicyQuery::default()).await.unwrap();
    let has_fqdn_peer = stored.iter().any(|p| match &p.spec {
        autopol::types::PolicyBody::Network(rs) => {
            matches!(&rs.peer, autopol::types::Destination::Fqdn { names } if names.contains(&"example.com".to_string()))
        }
        _ => false,
    });
    assert!(has_fqdn_peer, "a flow to a DNS-resolved IP should classify as an FQDN peer, not a CIDR");

    let has_implicit_dns_rule = stored.iter().any(|p| match &p.spec {
        autopol::types::PolicyBody::Network(rs) => {
            matches!(&rs.peer, autopol::types::Destination::Service { name, .. } if name == "kube-dns")
        }
        _ => false,
    });
    assert!(has_implicit_dns_rule, "an FQDN rule should carry an implicit kube-dns egress rule");
}

#[tokio::test]
async fn empty_snapshot_tick_completes_cleanly() {
    let provider = FixtureProvider::new();
    let store = Arc::new(InMemoryPolicyStore::new());
    let bus = Arc::new(PublishBus::new(64, 100));
    let worker = DiscoveryWorker::new("c1", one_shot_config(), Arc::new(provider), store.clone(), bus);

    worker.trigger_now().await;

    let status = worker.status().await;
    assert_eq!(status.tick_count, 1);
    assert!(status.last_error.is_none());
    assert!(store.query(&PolicyQuery::default()).await.unwrap().is_empty());
}
