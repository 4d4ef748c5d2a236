mod common;

use common::FixtureProvider;

use autopol::config::Config;
use autopol::ingest::{FlowIngestor, RawFlow};
use autopol::netpolicy::NetworkPolicySynthesizer;
use autopol::resolver::ResourceResolver;
use autopol::types::{Destination, Direction, L7Rule, PolicyBody, Protocol};

fn http_flow(path: &str) -> RawFlow {
    RawFlow {
        direction: Some(Direction::Egress),
        verdict: Some("allow".to_string()),
        src_ip: Some("10.0.0.1".to_string()),
        dst_ip: Some("10.0.0.9".to_string()),
        src_workload: "web".to_string(),
        dst_workload: "api".to_string(),
        src_namespace: "default".to_string(),
        dst_namespace: "default".to_string(),
        protocol: Some(Protocol::Tcp),
        dst_port: 8080,
        l7_http_method: Some("GET".to_string()),
        l7_http_path: Some(path.to_string()),
        l7_http_is_request: true,
        ..Default::default()
    }
}

/// End-to-end: raw HTTP flows through C1 canonicalization and C4
/// synthesis, exercising C3's threshold-based wildcard collapse on
/// genuine `L7Rule::Http` output rather than `aggregate_paths` directly.
#[tokio::test]
async fn many_numeric_user_paths_collapse_into_one_http_wildcard_rule() {
    let provider = FixtureProvider::new().with_pod("api", "default", "10.0.0.9", &[("app", "api")]);
    let mut resolver = ResourceResolver::new("c1", 64);
    resolver.refresh(&provider).await.unwrap();

    let mut config = Config::default();
    config.http_url_threshold = 3;

    let mut ingestor = FlowIngestor::new();
    for i in 0..10 {
        ingestor.ingest(&http_flow(&format!("/users/{i}")), 1000);
    }
    let flows = ingestor.snapshot();

    let mut synth = NetworkPolicySynthesizer::new();
    let policies = synth.synthesize("c1", &flows, &resolver, &config, 1000);

    assert_eq!(policies.len(), 1);
    let PolicyBody::Network(rule) = &policies[0].spec else { panic!("expected network policy") };
    match &rule.peer {
        Destination::InCluster { .. } => {}
        other => panic!("expected InCluster peer, got {other:?}"),
    }
    let L7Rule::Http { rules } = rule.l7.as_ref().expect("http rule expected") else {
        panic!("expected http l7 rule")
    };
    assert_eq!(rules.len(), 1, "distinct numeric paths should collapse into a single wildcard rule");
    assert!(rules[0].1.contains("[0-9"), "collapsed path should use a digit wildcard, got {}", rules[0].1);
}

#[tokio::test]
async fn wildcard_collapse_is_stable_across_ticks() {
    let provider = FixtureProvider::new().with_pod("api", "default", "10.0.0.9", &[("app", "api")]);
    let mut resolver = ResourceResolver::new("c1", 64);
    resolver.refresh(&provider).await.unwrap();

    let mut config = Config::default();
    config.http_url_threshold = 3;
    let mut synth = NetworkPolicySynthesizer::new();
    let mut ingestor = FlowIngestor::new();

    for i in 0..10 {
        ingestor.ingest(&http_flow(&format!("/users/{i}")), 1000);
    }
    let first_tick = synth.synthesize("c1", &ingestor.snapshot(), &resolver, &config, 1000);

    ingestor.ingest(&http_flow("/users/99"), 2000);
    let second_tick = synth.synthesize("c1", &ingestor.snapshot(), &resolver, &config, 2000);

    let PolicyBody::Network(first_rule) = &first_tick[0].spec else { panic!("expected network policy") };
    let PolicyBody::Network(second_rule) = &second_tick[0].spec else { panic!("expected network policy") };
    let L7Rule::Http { rules: first_rules } = first_rule.l7.as_ref().expect("http rule expected") else {
        panic!("expected http l7 rule")
    };
    let L7Rule::Http { rules: second_rules } = second_rule.l7.as_ref().expect("http rule expected") else {
        panic!("expected http l7 rule")
    };
    assert_eq!(first_rules.len(), second_rules.len(), "forest persisted across ticks should keep the same wildcard shape");
}
