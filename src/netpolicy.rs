use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::{net_policy_rule_types, AggregationLevel, Config};
use crate::http_tree::{self, Node};
use crate::resolver::ResourceResolver;
use crate::types::{
    stable_hash_hex, Destination, Direction, FlowRecord, L7Rule, LabelMap, Policy, PolicyBody,
    PolicyKind, PolicyStatus, PortProto, Protocol, RuleSet, Workload, L7,
};

/// One accumulated (peer, protocol) bucket while grouping flows that share
/// an owning workload (§4.4 L4 merge).
#[derive(Debug, Default)]
struct PeerBucket {
    ports: BTreeSet<PortProto>,
    dns_patterns: BTreeSet<String>,
    http_paths: HashMap<String, BTreeSet<String>>,
    flow_hashes: BTreeSet<String>,
}

/// C4 Network Policy Synthesizer. Owns the per-bucket HTTP path forests
/// across ticks so wildcard aggregation stays stable as new paths arrive
/// (§4.3/§4.4).
#[derive(Default)]
pub struct NetworkPolicySynthesizer {
    http_trees: HashMap<String, HashMap<String, Node>>,
}

impl NetworkPolicySynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn http_threshold(level: AggregationLevel, configured: usize) -> usize {
        match level {
            AggregationLevel::Literal => usize::MAX,
            AggregationLevel::Balanced => configured,
            AggregationLevel::Maximal => 1,
        }
    }

    fn cidr_bits(level: AggregationLevel, configured: u8) -> u8 {
        match level {
            AggregationLevel::Literal => 32,
            AggregationLevel::Balanced => configured,
            AggregationLevel::Maximal => configured.saturating_sub(8).max(8),
        }
    }

    /// Synthesize network policies from one tick's flow snapshot (§4.4).
    /// `cluster` identifies the cluster the flows and resolver belong to.
    pub fn synthesize(
        &mut self,
        cluster: &str,
        flows: &[FlowRecord],
        resolver: &ResourceResolver,
        config: &Config,
        now: i64,
    ) -> Vec<Policy> {
        let mut policies = Vec::new();
        let mut fqdn_workloads: BTreeSet<String> = BTreeSet::new();

        // owning workload key -> direction -> peer bucket key -> bucket
        let mut buckets: HashMap<(String, Direction), HashMap<String, (Workload, Protocol, PeerBucket)>> =
            HashMap::new();
        let mut owning_workloads: HashMap<String, Workload> = HashMap::new();

        for record in flows {
            let key = &record.key;
            if key.verdict != crate::types::Verdict::Allow {
                continue;
            }
            match key.direction {
                Direction::Egress if !config.egress_enabled() => continue,
                Direction::Ingress if !config.ingress_enabled() => continue,
                _ => {}
            }

            let (owning_ns, owning_labels, peer_ns, peer_ip, peer_labels) = match key.direction {
                Direction::Egress => {
                    (&key.src_namespace, &key.src_labels, &key.dst_namespace, &key.dst_ip, &key.dst_labels)
                }
                Direction::Ingress => {
                    (&key.dst_namespace, &key.dst_labels, &key.src_namespace, &key.src_ip, &key.src_labels)
                }
            };

            if !config.namespace_allowed(owning_ns) {
                continue;
            }

            let owning_workload = Workload::new(cluster, owning_ns, owning_labels);
            let owning_key = owning_workload.key();
            owning_workloads.entry(owning_key.clone()).or_insert_with(|| owning_workload.clone());

            let cidr_bits = Self::cidr_bits(config.net_policy_l3_level, config.net_policy_cidr_bits);
            let peer = resolver.resolve(peer_ip, peer_ns, peer_labels, cidr_bits);
            let peer_bucket_key = format!("{}|{:?}", peer.peer_key(), key.protocol);

            let entry = buckets
                .entry((owning_key.clone(), key.direction))
                .or_default()
                .entry(peer_bucket_key)
                .or_insert_with(|| (peer.clone(), key.protocol, PeerBucket::default()));

            entry.2.ports.insert(PortProto { protocol: key.protocol, port: key.dst_port });
            entry.2.flow_hashes.insert(stable_hash_hex(key)[..15].to_string());

            match &key.l7 {
                Some(L7::Dns { query }) => {
                    entry.2.dns_patterns.insert(query.clone());
                }
                Some(L7::Http { method, path }) => {
                    entry.2.http_paths.entry(method.clone()).or_default().insert(path.clone());
                }
                None => {}
            }

            if matches!(peer, Destination::Fqdn { .. }) {
                fqdn_workloads.insert(owning_key.clone());
            }
        }

        for ((owning_key, direction), peer_buckets) in buckets {
            let owning_workload = owning_workloads.get(&owning_key).expect("populated above");

            for (bucket_key, (peer, protocol, bucket)) in peer_buckets {
                if !self.rule_type_allowed(&peer, config) {
                    continue;
                }

                // net_policy_l4_level tunes how widely ports merge; with a
                // single peer+protocol bucket already scoped per discovery
                // tick, merging is union-of-observed-ports at every level.
                let ports: Vec<PortProto> = bucket.ports.iter().cloned().collect();

                let l7 = self.build_l7(&bucket_key, &bucket, protocol, config);

                if !config.rule_type_enabled(net_policy_rule_types::TO_HTTPS) && matches!(l7, Some(L7Rule::Http { .. }))
                {
                    continue;
                }
                if !config.rule_type_enabled(net_policy_rule_types::TO_FQDNS)
                    && matches!(l7, Some(L7Rule::Dns { .. }))
                    && matches!(peer, Destination::Fqdn { .. })
                {
                    continue;
                }

                let ruleset = RuleSet {
                    selector: owning_workload.normalized_labels.clone(),
                    direction,
                    peer,
                    ports,
                    l7,
                };

                let name = Policy::network_name(&ruleset);
                let flow_ids: Vec<String> = bucket.flow_hashes.into_iter().collect();
                policies.push(Policy {
                    kind: PolicyKind::Network,
                    api_version: "autopol.accuknox.io/v1".to_string(),
                    name,
                    cluster: cluster.to_string(),
                    namespace: owning_workload.namespace.clone(),
                    rule_type: Self::dominant_rule_type(&ruleset),
                    status: PolicyStatus::Latest,
                    spec: PolicyBody::Network(ruleset),
                    flow_ids,
                    generated_at: now,
                    updated_at: now,
                    outdated: None,
                });
            }
        }

        for owning_key in fqdn_workloads {
            if let Some(workload) = owning_workloads.get(&owning_key) {
                policies.push(self.implicit_dns_policy(workload, cluster, now));
            }
        }

        debug!(policies = policies.len(), "network policies synthesized");
        policies
    }

    fn build_l7(&mut self, bucket_key: &str, bucket: &PeerBucket, protocol: Protocol, config: &Config) -> Option<L7Rule> {
        if !bucket.dns_patterns.is_empty() {
            return Some(L7Rule::Dns { patterns: bucket.dns_patterns.iter().cloned().collect() });
        }
        if bucket.http_paths.is_empty() || !matches!(protocol, Protocol::Tcp) {
            return None;
        }

        let threshold = Self::http_threshold(config.net_policy_l7_level, config.http_url_threshold);
        let mut rules = Vec::new();
        for (method, paths) in &bucket.http_paths {
            let tree_key = format!("{bucket_key}|{method}");
            let tree = self.http_trees.entry(tree_key).or_default();
            let path_vec: Vec<String> = paths.iter().cloned().collect();
            let aggregated = http_tree::aggregate_paths(tree, &path_vec, threshold);
            for path in aggregated {
                rules.push((method.clone(), path));
            }
        }
        rules.sort();
        Some(L7Rule::Http { rules })
    }

    fn rule_type_allowed(&self, peer: &Destination, config: &Config) -> bool {
        let mask = match peer {
            Destination::InCluster { .. } => net_policy_rule_types::MATCH_LABELS,
            Destination::Cidr { .. } => net_policy_rule_types::TO_CIDRS,
            Destination::Entity { .. } => net_policy_rule_types::TO_ENTITIES,
            Destination::Service { .. } => net_policy_rule_types::TO_SERVICES,
            Destination::Fqdn { .. } => net_policy_rule_types::TO_FQDNS,
        };
        config.rule_type_enabled(mask) && config.rule_type_enabled(net_policy_rule_types::TO_PORTS)
    }

    fn dominant_rule_type(ruleset: &RuleSet) -> String {
        match &ruleset.peer {
            Destination::InCluster { .. } => "matchLabels",
            Destination::Cidr { .. } => "toCIDRs",
            Destination::Entity { .. } => "toEntities",
            Destination::Service { .. } => "toServices",
            Destination::Fqdn { .. } => "toFQDNs",
        }
        .to_string()
    }

    /// Implicit DNS egress rule attached once per workload with any FQDN
    /// rule, not once per FQDN (§12 Supplemented Detail).
    fn implicit_dns_policy(&self, workload: &Workload, cluster: &str, now: i64) -> Policy {
        let ruleset = RuleSet {
            selector: workload.normalized_labels.clone(),
            direction: Direction::Egress,
            peer: Destination::Service { namespace: "kube-system".to_string(), name: "kube-dns".to_string() },
            ports: vec![
                PortProto { protocol: Protocol::Udp, port: 53 },
                PortProto { protocol: Protocol::Tcp, port: 53 },
            ],
            l7: Some(L7Rule::Dns { patterns: vec!["*".to_string()] }),
        };
        let name = Policy::network_name(&ruleset);
        Policy {
            kind: PolicyKind::Network,
            api_version: "autopol.accuknox.io/v1".to_string(),
            name,
            cluster: cluster.to_string(),
            namespace: workload.namespace.clone(),
            rule_type: "toServices".to_string(),
            status: PolicyStatus::Latest,
            spec: PolicyBody::Network(ruleset),
            flow_ids: Vec::new(),
            generated_at: now,
            updated_at: now,
            outdated: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowKey, Verdict};

    fn labels(pairs: &[(&str, &str)]) -> LabelMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn allow_flow(dst_ip: &str, dst_port: u16) -> FlowRecord {
        let key = FlowKey {
            direction: Direction::Egress,
            verdict: Verdict::Allow,
            src_ip: "10.0.0.1".to_string(),
            dst_ip: dst_ip.to_string(),
            src_workload: "web".to_string(),
            dst_workload: "db".to_string(),
            src_namespace: "default".to_string(),
            dst_namespace: "default".to_string(),
            src_labels: labels(&[("app", "web")]),
            dst_labels: labels(&[("app", "db")]),
            protocol: Protocol::Tcp,
            src_port: 0,
            dst_port,
            l7: None,
            syn_only: false,
        };
        FlowRecord::new(key, 0)
    }

    #[test]
    fn synthesizes_one_policy_per_peer_bucket() {
        let mut synth = NetworkPolicySynthesizer::new();
        let resolver = ResourceResolver::new("c1", 16);
        let config = Config::default();
        let flows = vec![allow_flow("10.0.0.2", 5432)];
        let policies = synth.synthesize("c1", &flows, &resolver, &config, 1000);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].kind, PolicyKind::Network);
        if let PolicyBody::Network(rs) = &policies[0].spec {
            assert_eq!(rs.direction, Direction::Egress);
            assert!(rs.ports.contains(&PortProto { protocol: Protocol::Tcp, port: 5432 }));
        } else {
            panic!("expected network body");
        }
    }

    #[test]
    fn respects_egress_only_policy_type() {
        let mut synth = NetworkPolicySynthesizer::new();
        let resolver = ResourceResolver::new("c1", 16);
        let mut config = Config::default();
        config.net_policy_types = crate::config::net_policy_types::INGRESS;
        let flows = vec![allow_flow("10.0.0.2", 5432)];
        let policies = synth.synthesize("c1", &flows, &resolver, &config, 1000);
        assert!(policies.is_empty());
    }

    #[test]
    fn deny_flows_are_not_synthesized() {
        let mut synth = NetworkPolicySynthesizer::new();
        let resolver = ResourceResolver::new("c1", 16);
        let config = Config::default();
        let mut flow = allow_flow("10.0.0.2", 5432);
        flow.key.verdict = Verdict::Deny;
        let policies = synth.synthesize("c1", &[flow], &resolver, &config, 1000);
        assert!(policies.is_empty());
    }

    #[test]
    fn ignored_namespace_is_skipped() {
        let mut synth = NetworkPolicySynthesizer::new();
        let resolver = ResourceResolver::new("c1", 16);
        let config = Config::default();
        let mut flow = allow_flow("10.0.0.2", 5432);
        flow.key.src_namespace = "kube-system".to_string();
        let policies = synth.synthesize("c1", &[flow], &resolver, &config, 1000);
        assert!(policies.is_empty());
    }

    #[test]
    fn reserved_entity_peer_is_classified_from_raw_flow_data() {
        // The peer never carries an in-cluster workload, an FQDN
        // correlation, or a `reserved:` label surviving as a real
        // key=value label — only a dst_namespace of "reserved:world", the
        // shape `ingest.rs::reserved_label` actually derives from a bare
        // `"reserved:world"` flag. This must still classify as an Entity.
        let mut synth = NetworkPolicySynthesizer::new();
        let resolver = ResourceResolver::new("c1", 16);
        let config = Config::default();
        let mut flow = allow_flow("8.8.8.8", 53);
        flow.key.dst_namespace = "reserved:world".to_string();
        flow.key.dst_labels = LabelMap::new();
        let policies = synth.synthesize("c1", &[flow], &resolver, &config, 1000);
        assert_eq!(policies.len(), 1);
        let PolicyBody::Network(rs) = &policies[0].spec else { panic!("expected network body") };
        assert_eq!(rs.peer, Destination::Entity { name: "world".to_string() });
    }

    #[test]
    fn fqdn_flow_attaches_implicit_dns_rule() {
        let mut synth = NetworkPolicySynthesizer::new();
        let mut resolver = ResourceResolver::new("c1", 16);
        resolver.record_dns("example.com", vec!["93.184.216.34".to_string()]);
        let config = Config::default();
        let flows = vec![allow_flow("93.184.216.34", 443)];
        let policies = synth.synthesize("c1", &flows, &resolver, &config, 1000);
        let has_dns_rule = policies.iter().any(|p| match &p.spec {
            PolicyBody::Network(rs) => matches!(&rs.peer, Destination::Service { name, .. } if name == "kube-dns"),
            _ => false,
        });
        assert!(has_dns_rule);
    }
}
