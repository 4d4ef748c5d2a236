use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/* ============================= PRIMITIVES ============================= */

pub type LabelMap = BTreeMap<String, String>;

/// Direction of an observed or synthesized flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Egress,
    Ingress,
}

/// Observed verdict for a flow. Anything else is dropped at canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

/// L4 protocol. `Unknown` is kept (not dropped) per the original plugin's
/// behavior of defaulting to protocol 0 rather than discarding the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Unknown => "UNKNOWN",
        }
    }
}

/// Layer-7 detail attached to a flow or rule. Only *request* frames ever
/// reach this type — response/reply L7 frames are dropped at ingest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum L7 {
    Dns { query: String },
    Http { method: String, path: String },
}

/* ============================= FLOW RECORD ============================= */

/// Canonical, content-addressable network observation (§3 FlowRecord).
///
/// Two records with equal fields (everything except `count`/`updated_at`)
/// are the same record — the ingestor deduplicates on this equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowKey {
    pub direction: Direction,
    pub verdict: Verdict,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_workload: String,
    pub dst_workload: String,
    pub src_namespace: String,
    pub dst_namespace: String,
    pub src_labels: LabelMap,
    pub dst_labels: LabelMap,
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub l7: Option<L7>,
    pub syn_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub count: u64,
    pub updated_at: i64,
}

impl FlowRecord {
    pub fn new(key: FlowKey, now_millis: i64) -> Self {
        Self {
            key,
            count: 1,
            updated_at: now_millis,
        }
    }

    pub fn merge(&mut self, now_millis: i64) {
        self.count += 1;
        self.updated_at = now_millis;
    }
}

/* ============================= SYS EVENT RECORD ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SysOperation {
    #[default]
    Process,
    File,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SysResult {
    Passed,
    Failed,
}

/// Canonical system-behavior observation (§3 SysEventRecord).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SysEventKey {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub labels: LabelMap,
    pub operation: SysOperation,
    /// Parent-process binary path that initiated this operation.
    pub source: String,
    pub resource: String,
    pub action: String,
    pub result: SysResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysEventRecord {
    pub key: SysEventKey,
    pub count: u64,
    pub updated_at: i64,
}

impl SysEventRecord {
    pub fn new(key: SysEventKey, now_millis: i64) -> Self {
        Self {
            key,
            count: 1,
            updated_at: now_millis,
        }
    }

    pub fn merge(&mut self, now_millis: i64) {
        self.count += 1;
        self.updated_at = now_millis;
    }
}

/* ============================= WORKLOAD ============================= */

/// Stable workload identity: a set of pods indistinguishable by their
/// normalized labels (§3 Workload).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workload {
    pub cluster: String,
    pub namespace: String,
    pub normalized_labels: LabelMap,
}

/// Label keys stripped during normalization — volatile, pod-instance
/// identifiers that must not distinguish otherwise-identical workloads.
pub const VOLATILE_LABEL_KEYS: &[&str] = &[
    "pod-template-hash",
    "controller-revision-hash",
    "statefulset.kubernetes.io/pod-name",
];

/// Strip volatile keys and sort so equal workloads hash equal.
pub fn normalize_labels(labels: &LabelMap) -> LabelMap {
    labels
        .iter()
        .filter(|(k, _)| !VOLATILE_LABEL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Workload {
    pub fn new(cluster: &str, namespace: &str, labels: &LabelMap) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            normalized_labels: normalize_labels(labels),
        }
    }

    /// Stable string key suitable for use as a map key or log field.
    pub fn key(&self) -> String {
        let labels: Vec<String> = self
            .normalized_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}/{}/{}", self.cluster, self.namespace, labels.join(","))
    }
}

/* ============================= DESTINATION ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Destination {
    InCluster { workload: Workload },
    Cidr { bits: u8, address: String },
    Entity { name: String },
    Service { namespace: String, name: String },
    Fqdn { names: Vec<String> },
}

impl Destination {
    pub fn peer_key(&self) -> String {
        match self {
            Destination::InCluster { workload } => format!("in-cluster:{}", workload.key()),
            Destination::Cidr { bits, address } => format!("cidr:{address}/{bits}"),
            Destination::Entity { name } => format!("entity:{name}"),
            Destination::Service { namespace, name } => format!("service:{namespace}/{name}"),
            Destination::Fqdn { names } => format!("fqdn:{}", names.join(",")),
        }
    }
}

/// Reserved entity names recognized from `reserved:<name>` labels.
pub const RESERVED_ENTITIES: &[&str] = &["world", "host", "remote-node", "kube-apiserver", "unmanaged"];

/* ============================= RULESET ============================= */

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortProto {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum L7Rule {
    Dns { patterns: Vec<String> },
    Http { rules: Vec<(String, String)> },
}

/// Synthesized policy body (§3 RuleSet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub selector: LabelMap,
    pub direction: Direction,
    pub peer: Destination,
    pub ports: Vec<PortProto>,
    pub l7: Option<L7Rule>,
}

impl RuleSet {
    /// A RuleSet with only `peer = Entity{world}` and no ports matches all
    /// external traffic (§3 invariant).
    pub fn is_allow_all_world(&self) -> bool {
        matches!(&self.peer, Destination::Entity { name } if name == "world") && self.ports.is_empty()
    }

    /// Structural strict-subset test used for supersession (§4.4/§4.5):
    /// `self` is subsumed by `other` if same selector/direction/peer and
    /// `self`'s ports/paths are a proper subset of `other`'s.
    pub fn is_strict_subset_of(&self, other: &RuleSet) -> bool {
        if self.selector != other.selector || self.direction != other.direction {
            return false;
        }
        if self.peer != other.peer {
            return false;
        }
        let self_ports: std::collections::BTreeSet<_> = self.ports.iter().cloned().collect();
        let other_ports: std::collections::BTreeSet<_> = other.ports.iter().cloned().collect();
        if !self_ports.is_subset(&other_ports) {
            return false;
        }
        let strictly_smaller_ports = self_ports.len() < other_ports.len();

        let (l7_subset, l7_strictly_smaller) = match (&self.l7, &other.l7) {
            (None, _) => (true, other.l7.is_some()),
            (Some(_), None) => (false, false),
            (Some(L7Rule::Dns { patterns: a }), Some(L7Rule::Dns { patterns: b })) => {
                let sa: std::collections::BTreeSet<_> = a.iter().collect();
                let sb: std::collections::BTreeSet<_> = b.iter().collect();
                (sa.is_subset(&sb), sa.len() < sb.len())
            }
            (Some(L7Rule::Http { rules: a }), Some(L7Rule::Http { rules: b })) => {
                let sa: std::collections::BTreeSet<_> = a.iter().collect();
                let sb: std::collections::BTreeSet<_> = b.iter().collect();
                (sa.is_subset(&sb), sa.len() < sb.len())
            }
            _ => (false, false),
        };

        l7_subset && (strictly_smaller_ports || l7_strictly_smaller)
    }
}

/* ============================= POLICY ENVELOPE ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyKind {
    Network,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyStatus {
    Latest,
    Outdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyRuleType {
    MatchLabels,
    ToPorts,
    ToHttps,
    ToCidrs,
    ToEntities,
    ToServices,
    ToFqdns,
}

/// Per-`(cluster, namespace, container, labels, fromSource, settype)`
/// system-policy body (§4.5). `settype` distinguishes process-origin from
/// file-origin grants — a bucket never mixes the two into one ruleset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRuleSet {
    pub selector: LabelMap,
    pub container: String,
    pub from_source: String,
    pub settype: SysOperation,
    pub match_process_paths: Vec<String>,
    pub match_file_paths: Vec<String>,
}

impl SystemRuleSet {
    pub fn is_subset_of(&self, other: &SystemRuleSet) -> bool {
        if self.selector != other.selector
            || self.container != other.container
            || self.from_source != other.from_source
            || self.settype != other.settype
        {
            return false;
        }
        let sp: std::collections::BTreeSet<_> = self.match_process_paths.iter().collect();
        let op: std::collections::BTreeSet<_> = other.match_process_paths.iter().collect();
        let sf: std::collections::BTreeSet<_> = self.match_file_paths.iter().collect();
        let of: std::collections::BTreeSet<_> = other.match_file_paths.iter().collect();
        sp.is_subset(&op) && sf.is_subset(&of) && (sp.len() < op.len() || sf.len() < of.len())
    }
}

/// Body of a synthesized policy — either a network RuleSet or a system
/// allow-list. Kept as an enum rather than two top-level Policy types so
/// the store/bus can stay generic over `PolicyLike` (§9 Design Notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "bodyKind")]
pub enum PolicyBody {
    Network(RuleSet),
    System(SystemRuleSet),
}

/// Envelope wrapping a synthesized RuleSet with identity and lifecycle
/// (§3 Policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub kind: PolicyKind,
    pub api_version: String,
    pub name: String,
    pub cluster: String,
    pub namespace: String,
    pub rule_type: String,
    pub status: PolicyStatus,
    pub spec: PolicyBody,
    pub flow_ids: Vec<String>,
    pub generated_at: i64,
    pub updated_at: i64,
    pub outdated: Option<String>,
}

/// Deterministic digest of a serializable value, used to name policies
/// (`name(p) = hash(spec(p))[:15]`) and as flow/event identity where a
/// stable short id is needed. Not cryptographic — the only requirement is
/// that structurally equal specs hash equal, which `serde_json`'s BTreeMap
/// key ordering + a standard hasher already guarantees.
pub fn stable_hash_hex(value: &impl Serialize) -> String {
    let canonical = serde_json::to_vec(value).expect("policy bodies are always serializable");
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    // Run twice with a salted seed to get enough hex digits for a 15-char
    // prefix without relying on a wider hash crate the teacher never pulls in.
    let h1 = hasher.finish();
    let mut hasher2 = std::collections::hash_map::DefaultHasher::new();
    (canonical, 0xA5A5_u64).hash(&mut hasher2);
    let h2 = hasher2.finish();
    format!("{h1:016x}{h2:016x}")
}

impl Policy {
    /// The vendor CRD kind this policy would be emitted as (§6 Response
    /// stream `kind` field; §9 `IsKind`/`ToYaml`).
    pub fn vendor_kind(&self) -> &'static str {
        match self.kind {
            PolicyKind::Network => "CiliumNetworkPolicy",
            PolicyKind::System => "KubeArmorPolicy",
        }
    }

    pub fn network_name(ruleset: &RuleSet) -> String {
        let direction = match ruleset.direction {
            Direction::Egress => "egress",
            Direction::Ingress => "ingress",
        };
        let digest = stable_hash_hex(ruleset);
        format!("autopol-{direction}-{}", &digest[..15])
    }

    /// Named from the bucket's identity tuple only (`selector` + `container`
    /// + `from_source` + `settype`) — never from `match_process_paths`/
    /// `match_file_paths`, which widen every tick a bucket is re-observed.
    /// Hashing the filesets would change the name on every widening and
    /// defeat `PolicyStore::insert_or_update`'s name-match update path.
    pub fn system_name(ruleset: &SystemRuleSet) -> String {
        #[derive(Serialize)]
        struct Identity<'a> {
            selector: &'a LabelMap,
            container: &'a str,
            from_source: &'a str,
            settype: SysOperation,
        }
        let identity = Identity {
            selector: &ruleset.selector,
            container: &ruleset.container,
            from_source: &ruleset.from_source,
            settype: ruleset.settype,
        };
        let digest = stable_hash_hex(&identity);
        format!("autopol-system-{}", &digest[..15])
    }
}

/// The "duck-typed policy interface" from §9 Design Notes, modeled as a
/// Rust trait rather than reflection: `GetType/GetName/GetCluster/
/// GetLabels/IsKind/ToYaml` become ordinary trait methods the publish bus
/// is generic over.
pub trait PolicyLike {
    fn policy_type(&self) -> PolicyKind;
    fn name(&self) -> &str;
    fn cluster(&self) -> &str;
    fn namespace(&self) -> &str;
    fn selector_labels(&self) -> &LabelMap;
    fn is_kind(&self, vendor_kind: &str) -> bool;
    fn to_yaml(&self, vendor_kind: &str) -> Option<String>;
}

impl PolicyLike for Policy {
    fn policy_type(&self) -> PolicyKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn selector_labels(&self) -> &LabelMap {
        match &self.spec {
            PolicyBody::Network(rs) => &rs.selector,
            PolicyBody::System(rs) => &rs.selector,
        }
    }

    fn is_kind(&self, vendor_kind: &str) -> bool {
        self.vendor_kind().eq_ignore_ascii_case(vendor_kind)
    }

    /// Render the vendor CRD manifest for `vendor_kind`, or `None` if this
    /// policy doesn't produce that kind (§6 Response stream: one `kind` per
    /// requested output format).
    fn to_yaml(&self, vendor_kind: &str) -> Option<String> {
        if !self.is_kind(vendor_kind) {
            return None;
        }
        let spec_yaml = serde_yaml::to_string(&self.spec).ok()?;
        let indented_spec: String = spec_yaml
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        Some(format!(
            "apiVersion: {api_version}\nkind: {kind}\nmetadata:\n  name: {name}\n  namespace: {namespace}\n  labels:\n    autopol.accuknox.io/cluster: {cluster}\n    app.kubernetes.io/managed-by: autopol\nspec:\n{indented_spec}",
            api_version = self.api_version,
            kind = self.vendor_kind(),
            name = self.name,
            namespace = self.namespace,
            cluster = self.cluster,
        ))
    }
}
