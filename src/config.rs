use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= OPERATION MODE ============================= */

/// `operation_mode` (§6): 1 = cron, 2 = one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Cron,
    OneShot,
}

/// `cluster_info_from` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterInfoFrom {
    #[default]
    K8sClient,
    ApiServer,
}

/* ============================= BITMASKS ============================= */

/// `net_policy_types` bitmask: `egress=1|ingress=2|all=3`.
pub mod net_policy_types {
    pub const EGRESS: u8 = 1;
    pub const INGRESS: u8 = 2;
    pub const ALL: u8 = EGRESS | INGRESS;
}

/// `net_policy_rule_types` bitmask — which peer-kinds are emitted.
pub mod net_policy_rule_types {
    pub const MATCH_LABELS: u16 = 1 << 0;
    pub const TO_PORTS: u16 = 1 << 1;
    pub const TO_HTTPS: u16 = 1 << 2;
    pub const TO_CIDRS: u16 = 1 << 3;
    pub const TO_ENTITIES: u16 = 1 << 4;
    pub const TO_SERVICES: u16 = 1 << 5;
    pub const TO_FQDNS: u16 = 1 << 6;
    pub const ALL: u16 = MATCH_LABELS | TO_PORTS | TO_HTTPS | TO_CIDRS | TO_ENTITIES | TO_SERVICES | TO_FQDNS;
}

/// Aggregation level, 1..3, controlling how aggressively peers/ports/paths
/// are merged (§1 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[repr(u8)]
pub enum AggregationLevel {
    Literal = 1,
    Balanced = 2,
    Maximal = 3,
}

impl Default for AggregationLevel {
    fn default() -> Self {
        AggregationLevel::Balanced
    }
}

/* ============================= CONFIG ============================= */

/// Daemon configuration (§6). Loaded from an optional YAML file with CLI
/// flag overrides layered on top; every field has a spec-mandated default.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub operation_mode: OperationMode,
    pub cron_job_time_interval: String,

    pub network_log_from: String,
    pub system_log_from: String,

    pub net_policy_types: u8,
    pub net_policy_rule_types: u16,
    pub net_policy_cidr_bits: u8,

    pub net_policy_l3_level: AggregationLevel,
    pub net_policy_l4_level: AggregationLevel,
    pub net_policy_l7_level: AggregationLevel,

    pub http_url_threshold: usize,

    pub ignoring_namespaces: Vec<String>,

    pub cluster_info_from: ClusterInfoFrom,

    /// `NsFilter` (§9 Open Question) — namespaces to include; empty means all.
    pub ns_filter: Vec<String>,
    /// `NsNotFilter` (§9 Open Question) — namespaces to exclude; takes
    /// precedence over `ns_filter` when both name the same namespace,
    /// per the decision recorded in DESIGN.md.
    pub ns_not_filter: Vec<String>,

    /// When true, a prior system policy whose fileset is a proper subset
    /// of a new one is marked outdated (§4.5 Deprecation switch).
    pub deprecate_old_system_mode: bool,

    /// DNS correlation cache capacity (§4.2).
    pub dns_cache_capacity: usize,

    /// Fan-out enqueue timeout in milliseconds (§5).
    pub fanout_enqueue_timeout_ms: u64,
    /// Per-consumer bounded queue depth (§4.7/§5).
    pub fanout_queue_depth: usize,
    /// Per-external-call timeout in seconds (§5).
    pub external_call_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::default(),
            cron_job_time_interval: "@every 1h".to_string(),
            network_log_from: "hubble".to_string(),
            system_log_from: "kubearmor".to_string(),
            net_policy_types: net_policy_types::ALL,
            net_policy_rule_types: net_policy_rule_types::ALL,
            net_policy_cidr_bits: 32,
            net_policy_l3_level: AggregationLevel::default(),
            net_policy_l4_level: AggregationLevel::default(),
            net_policy_l7_level: AggregationLevel::default(),
            http_url_threshold: 5,
            ignoring_namespaces: vec!["kube-system".to_string()],
            cluster_info_from: ClusterInfoFrom::default(),
            ns_filter: Vec::new(),
            ns_not_filter: Vec::new(),
            deprecate_old_system_mode: true,
            dns_cache_capacity: 4096,
            fanout_enqueue_timeout_ms: 100,
            fanout_queue_depth: 256,
            external_call_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(s)?;
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        Self::from_yaml_str(&contents)
    }

    pub fn schema_json() -> anyhow::Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    /// `NsNotFilter` takes precedence over `NsFilter` when both name the
    /// same namespace (§9 Open Question — decided, see DESIGN.md).
    pub fn namespace_allowed(&self, ns: &str) -> bool {
        if self.ns_not_filter.iter().any(|n| n == ns) {
            return false;
        }
        if self.ignoring_namespaces.iter().any(|n| n == ns) {
            return false;
        }
        if self.ns_filter.is_empty() {
            return true;
        }
        self.ns_filter.iter().any(|n| n == ns)
    }

    pub fn egress_enabled(&self) -> bool {
        self.net_policy_types & net_policy_types::EGRESS != 0
    }

    pub fn ingress_enabled(&self) -> bool {
        self.net_policy_types & net_policy_types::INGRESS != 0
    }

    pub fn rule_type_enabled(&self, mask: u16) -> bool {
        self.net_policy_rule_types & mask != 0
    }
}
