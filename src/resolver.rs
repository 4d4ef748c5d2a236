use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod, Service};
use kube::{Api, Client};
use tracing::debug;

use crate::types::{Destination, LabelMap, Workload, RESERVED_ENTITIES};

/* ============================= RESOURCE PROVIDER CONTRACT ============================= */

/// Minimal pod/service/endpoint/namespace view needed to resolve flow
/// endpoints into workloads (§6 consumed contract: ResourceProvider).
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub labels: LabelMap,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub cluster_ip: Option<String>,
    pub selector: LabelMap,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointsInfo {
    pub name: String,
    pub namespace: String,
    pub addresses: Vec<String>,
}

#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn get_pods(&self, cluster: &str) -> anyhow::Result<Vec<PodInfo>>;
    async fn get_services(&self, cluster: &str) -> anyhow::Result<Vec<ServiceInfo>>;
    async fn get_endpoints(&self, cluster: &str) -> anyhow::Result<Vec<EndpointsInfo>>;
    async fn get_namespaces(&self, cluster: &str) -> anyhow::Result<Vec<String>>;
}

/// `ClusterInfoFrom = k8s_client` implementation (§6): talks to the API
/// server directly through `kube`, one `Client` per cluster/context name.
pub struct KubeClientProvider {
    clients: HashMap<String, Client>,
}

impl KubeClientProvider {
    pub fn new() -> Self {
        Self { clients: HashMap::new() }
    }

    /// List kubeconfig contexts available on this host.
    pub fn list_contexts() -> anyhow::Result<Vec<String>> {
        let kubeconfig = kube::config::Kubeconfig::read()?;
        Ok(kubeconfig.contexts.iter().map(|c| c.name.clone()).collect())
    }

    /// Build (and cache) a client for a given kubeconfig context name.
    pub async fn client_for(&mut self, context: &str) -> anyhow::Result<Client> {
        if let Some(client) = self.clients.get(context) {
            return Ok(client.clone());
        }
        let kubeconfig = kube::config::Kubeconfig::read()?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            },
        )
        .await?;
        let client = Client::try_from(config)?;
        self.clients.insert(context.to_string(), client.clone());
        Ok(client)
    }
}

impl Default for KubeClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceProvider for KubeClientProvider {
    async fn get_pods(&self, cluster: &str) -> anyhow::Result<Vec<PodInfo>> {
        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| anyhow::anyhow!("no cached client for cluster {cluster}"))?;
        let api: Api<Pod> = Api::all(client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|p| PodInfo {
                name: p.metadata.name.unwrap_or_default(),
                namespace: p.metadata.namespace.unwrap_or_default(),
                ip: p.status.and_then(|s| s.pod_ip),
                labels: p.metadata.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn get_services(&self, cluster: &str) -> anyhow::Result<Vec<ServiceInfo>> {
        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| anyhow::anyhow!("no cached client for cluster {cluster}"))?;
        let api: Api<Service> = Api::all(client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|s| {
                let spec = s.spec.unwrap_or_default();
                ServiceInfo {
                    name: s.metadata.name.unwrap_or_default(),
                    namespace: s.metadata.namespace.unwrap_or_default(),
                    cluster_ip: spec.cluster_ip,
                    selector: spec.selector.unwrap_or_default().into_iter().collect(),
                }
            })
            .collect())
    }

    async fn get_endpoints(&self, cluster: &str) -> anyhow::Result<Vec<EndpointsInfo>> {
        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| anyhow::anyhow!("no cached client for cluster {cluster}"))?;
        let api: Api<Endpoints> = Api::all(client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|e| {
                let addresses = e
                    .subsets
                    .unwrap_or_default()
                    .into_iter()
                    .flat_map(|s| s.addresses.unwrap_or_default())
                    .map(|a| a.ip)
                    .collect();
                EndpointsInfo {
                    name: e.metadata.name.unwrap_or_default(),
                    namespace: e.metadata.namespace.unwrap_or_default(),
                    addresses,
                }
            })
            .collect())
    }

    async fn get_namespaces(&self, cluster: &str) -> anyhow::Result<Vec<String>> {
        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| anyhow::anyhow!("no cached client for cluster {cluster}"))?;
        let api: Api<Namespace> = Api::all(client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list.items.into_iter().filter_map(|n| n.metadata.name).collect())
    }
}

/* ============================= WORKLOAD RESOLUTION ============================= */

fn reserved_entity_from_labels(labels: &LabelMap) -> Option<String> {
    labels.iter().find_map(|(k, _)| {
        k.strip_prefix("reserved:")
            .filter(|name| RESERVED_ENTITIES.contains(name))
            .map(|name| name.to_string())
    })
}

/// A `reserved:<name>` flag survives the real ingest pipeline as the peer's
/// *namespace* (`ingest.rs::reserved_label`/`canonicalize_flow` derive
/// `dst_namespace`/`src_namespace` from it when the vendor namespace is
/// empty — bare label flags with no `=` don't survive `labels_to_map`).
/// This is the path `resolve()` actually reaches through production data;
/// `reserved_entity_from_labels` above is kept as a fallback for sources
/// that do carry the flag as a real `key=value` label.
fn reserved_entity_from_namespace(namespace: &str) -> Option<String> {
    namespace
        .strip_prefix("reserved:")
        .filter(|name| RESERVED_ENTITIES.contains(name))
        .map(|name| name.to_string())
}

/// Identity cache + DNS correlation for turning raw (ip, labels) flow
/// endpoints into `Destination`s (§4.2 C2 Resource Resolver).
pub struct ResourceResolver {
    cluster: String,
    /// `(namespace, name) -> Workload`, refreshed once per tick from a
    /// ResourceProvider snapshot.
    by_identity: HashMap<(String, String), Workload>,
    /// `ip -> Workload`, built from the same snapshot.
    by_ip: HashMap<String, Workload>,
    /// `query -> [ips]` DNS correlation, bounded LRU (§4.2).
    dns_cache: LruMap<String, Vec<String>>,
}

impl ResourceResolver {
    pub fn new(cluster: &str, dns_cache_capacity: usize) -> Self {
        Self {
            cluster: cluster.to_string(),
            by_identity: HashMap::new(),
            by_ip: HashMap::new(),
            dns_cache: LruMap::new(dns_cache_capacity.max(1)),
        }
    }

    /// Refresh the identity/IP caches from a provider snapshot. Called once
    /// at the start of each discovery tick (§5 Shared resources).
    pub async fn refresh(&mut self, provider: &dyn ResourceProvider) -> anyhow::Result<()> {
        let pods = provider.get_pods(&self.cluster).await?;
        self.by_identity.clear();
        self.by_ip.clear();
        for pod in pods {
            let workload = Workload::new(&self.cluster, &pod.namespace, &pod.labels);
            self.by_identity
                .insert((pod.namespace.clone(), pod.name.clone()), workload.clone());
            if let Some(ip) = pod.ip {
                self.by_ip.insert(ip, workload);
            }
        }
        debug!(cluster = %self.cluster, pods = self.by_ip.len(), "resolver cache refreshed");
        Ok(())
    }

    /// Record a resolved DNS answer (`query -> ips`) for later correlation.
    /// Trailing dots must already be stripped by the ingestor (§4.1).
    pub fn record_dns(&mut self, query: &str, ips: Vec<String>) {
        self.dns_cache.put(query.to_string(), ips);
    }

    /// Resolve an observed destination IP, its peer namespace, and its
    /// flow-carried labels into a `Destination` (§4.2). Precedence:
    /// in-cluster workload by IP, then a reserved entity (namespace-derived,
    /// falling back to a literal label), then a DNS-correlated FQDN, then a
    /// bare CIDR.
    pub fn resolve(&self, ip: &str, peer_namespace: &str, flow_labels: &LabelMap, cidr_bits: u8) -> Destination {
        if let Some(workload) = self.by_ip.get(ip) {
            return Destination::InCluster { workload: workload.clone() };
        }
        if let Some(name) =
            reserved_entity_from_namespace(peer_namespace).or_else(|| reserved_entity_from_labels(flow_labels))
        {
            return Destination::Entity { name };
        }
        if let Some(names) = self.fqdn_for_ip(ip) {
            return Destination::Fqdn { names };
        }
        Destination::Cidr { bits: cidr_bits, address: mask_to_network(ip, cidr_bits) }
    }

    fn fqdn_for_ip(&self, ip: &str) -> Option<Vec<String>> {
        let matches: Vec<String> = self
            .dns_cache
            .iter()
            .filter(|(_, ips)| ips.contains(&ip.to_string()))
            .map(|(query, _)| query.clone())
            .collect();
        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }
}

/// Mask `ip` to its `bits`-wide network address (§3 data-model invariant:
/// "address masked to bits"). Falls back to the unmasked address for
/// anything that doesn't parse as IPv4 (e.g. a future IPv6 peer) rather
/// than dropping the flow.
fn mask_to_network(ip: &str, bits: u8) -> String {
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return ip.to_string();
    };
    let bits = bits.min(32);
    let mask: u32 = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    let masked = u32::from(addr) & mask;
    Ipv4Addr::from(masked).to_string()
}

/* ============================= LRU MAP ============================= */

/// Small bounded LRU map. No LRU crate appears anywhere in the retrieval
/// pack, so this hand-rolled version stands in (§4.2 DNS cache).
pub struct LruMap<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K, V> LruMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), entries: HashMap::new() }
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
