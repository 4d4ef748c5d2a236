use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{
    Direction, FlowKey, FlowRecord, L7, Protocol, SysEventKey, SysEventRecord, SysOperation,
    SysResult, Verdict,
};

/* ============================= VENDOR-FACING RAW SHAPES ============================= */

/// What a log source hands the ingestor before canonicalization. Field
/// names mirror the vendor flow shape the original plugin consumes
/// (`flow.Flow` from Cilium/Hubble) closely enough that `queryRange`/
/// `stream` adapters can build one without extra translation.
#[derive(Debug, Clone, Default)]
pub struct RawFlow {
    pub direction: Option<Direction>,
    pub verdict: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_workload: String,
    pub dst_workload: String,
    pub src_namespace: String,
    pub dst_namespace: String,
    pub src_labels: Vec<String>,
    pub dst_labels: Vec<String>,
    pub protocol: Option<Protocol>,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_syn: bool,
    pub tcp_ack: bool,
    pub l7_dns_query: Option<String>,
    pub l7_dns_is_request: bool,
    /// Resolved IPs carried by a DNS response frame (`l7_dns_is_request ==
    /// false`). Empty on request frames. Feeds `ResourceResolver::record_dns`
    /// for FQDN promotion (§4.2/§4.4 item 7).
    pub l7_dns_response_ips: Vec<String>,
    pub l7_http_method: Option<String>,
    pub l7_http_path: Option<String>,
    pub l7_http_is_request: bool,
}

/// Raw system-behavior event from KubeArmor-style log relays.
#[derive(Debug, Clone, Default)]
pub struct RawSysEvent {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub labels: Vec<String>,
    pub operation: Option<SysOperation>,
    pub source: String,
    pub resource: String,
    pub action: String,
    pub result: Option<SysResult>,
}

/// §6 Log-source adapter (consumed): transport-only, canonicalization is
/// this module's job. A real implementation streams from Hubble/KubeArmor
/// relays; tests and the CLI use an in-memory fixture implementation.
#[async_trait::async_trait]
pub trait FlowLogSource: Send + Sync {
    async fn query_range(&self, from_millis: i64, to_millis: i64) -> anyhow::Result<Vec<RawFlow>>;
}

#[async_trait::async_trait]
pub trait SysLogSource: Send + Sync {
    async fn query_range(&self, from_millis: i64, to_millis: i64) -> anyhow::Result<Vec<RawSysEvent>>;
}

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

/// Reserved-label prefix used to recover a namespace/entity name when the
/// vendor flow reports an empty namespace (§4.1).
const RESERVED_PREFIX: &str = "reserved:";

fn reserved_label(labels: &[String]) -> Option<String> {
    labels
        .iter()
        .find(|l| l.starts_with(RESERVED_PREFIX))
        .cloned()
}

fn labels_to_map(labels: &[String]) -> crate::types::LabelMap {
    labels
        .iter()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Canonicalize a raw flow into a `FlowKey`, or `None` if it must be
/// dropped (§4.1). Returning `None` is not an error — it's a counted,
/// silent Data-kind drop (§7).
pub fn canonicalize_flow(raw: &RawFlow) -> Option<FlowKey> {
    let verdict = match raw.verdict.as_deref() {
        Some("allow") => Verdict::Allow,
        Some("deny") => Verdict::Deny,
        _ => {
            debug!(verdict = ?raw.verdict, "dropping flow with unknown verdict");
            return None;
        }
    };

    if raw.src_ip.is_none() || raw.dst_ip.is_none() {
        debug!("dropping flow missing L3 IPs");
        return None;
    }

    let direction = raw.direction?;

    let src_namespace = if raw.src_namespace.is_empty() {
        reserved_label(&raw.src_labels).unwrap_or_default()
    } else {
        raw.src_namespace.clone()
    };
    let dst_namespace = if raw.dst_namespace.is_empty() {
        reserved_label(&raw.dst_labels).unwrap_or_default()
    } else {
        raw.dst_namespace.clone()
    };

    let protocol = raw.protocol.unwrap_or(Protocol::Unknown);
    let syn_only = matches!(protocol, Protocol::Tcp) && raw.tcp_syn && !raw.tcp_ack;

    let l7 = canonicalize_l7(raw);
    // A non-request L7 frame on an otherwise-valid flow means the frame
    // itself should be dropped, not the underlying flow — but since this
    // crate doesn't split flow/L7 into separate streams, a reply-only L7
    // frame simply yields no l7 detail rather than dropping the flow.

    if raw.src_workload == raw.dst_workload && !raw.src_workload.is_empty() {
        // §3 invariant: intra-workload traffic is not a privilege boundary.
        debug!(workload = %raw.src_workload, "dropping self-to-self flow");
        return None;
    }

    Some(FlowKey {
        direction,
        verdict,
        src_ip: raw.src_ip.clone().unwrap_or_default(),
        dst_ip: raw.dst_ip.clone().unwrap_or_default(),
        src_workload: raw.src_workload.clone(),
        dst_workload: raw.dst_workload.clone(),
        src_namespace,
        dst_namespace,
        src_labels: labels_to_map(&raw.src_labels),
        dst_labels: labels_to_map(&raw.dst_labels),
        protocol,
        src_port: raw.src_port,
        dst_port: raw.dst_port,
        l7,
        syn_only,
    })
}

/// Extract a DNS correlation answer (`query -> resolved ips`) from a
/// response frame, or `None` if `raw` isn't one. Independent of
/// `canonicalize_l7`: a response frame carries no `L7` rule detail of its
/// own, but its resolved IPs still need to reach `ResourceResolver::
/// record_dns` so a later flow to one of those IPs can be classified as an
/// FQDN peer (§4.2, §4.4 item 7, §8 scenario 3).
pub fn extract_dns_answer(raw: &RawFlow) -> Option<(String, Vec<String>)> {
    let query = raw.l7_dns_query.as_ref()?;
    if raw.l7_dns_is_request || raw.l7_dns_response_ips.is_empty() {
        return None;
    }
    let trimmed = query.trim_end_matches('.').to_string();
    Some((trimmed, raw.l7_dns_response_ips.clone()))
}

fn canonicalize_l7(raw: &RawFlow) -> Option<L7> {
    if let Some(query) = &raw.l7_dns_query {
        if !raw.l7_dns_is_request {
            return None;
        }
        let trimmed = query.trim_end_matches('.').to_string();
        return Some(L7::Dns { query: trimmed });
    }

    if let (Some(method), Some(path)) = (&raw.l7_http_method, &raw.l7_http_path) {
        if !raw.l7_http_is_request {
            return None;
        }
        let method_upper = method.to_uppercase();
        if !HTTP_METHODS.contains(&method_upper.as_str()) {
            return None;
        }
        let path_only = path.split('?').next().unwrap_or(path).to_string();
        return Some(L7::Http { method: method_upper, path: path_only });
    }

    None
}

/// Canonicalize a raw system event, or `None` to drop it.
pub fn canonicalize_sys_event(raw: &RawSysEvent) -> Option<SysEventKey> {
    let operation = raw.operation?;
    let result = raw.result?;
    if raw.source.is_empty() || raw.resource.is_empty() {
        return None;
    }

    Some(SysEventKey {
        cluster: raw.cluster.clone(),
        namespace: raw.namespace.clone(),
        pod: raw.pod.clone(),
        container: raw.container.clone(),
        labels: labels_to_map(&raw.labels),
        operation,
        source: raw.source.clone(),
        resource: raw.resource.clone(),
        action: raw.action.clone(),
        result,
    })
}

/* ============================= DEDUP TABLE ============================= */

#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: u64,
    pub dropped: u64,
}

/// In-memory table keyed by content hash (here, by `FlowKey` equality via
/// `HashMap`), deduplicating and counting observations (§4.1).
///
/// Owned solely by the ingestor; synthesizers only ever see an atomic
/// snapshot taken at the start of a pass (§5 Shared resources).
#[derive(Default)]
pub struct FlowIngestor {
    table: HashMap<FlowKey, FlowRecord>,
    stats: IngestStats,
    dns_answers: Vec<(String, Vec<String>)>,
}

impl FlowIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one raw flow, canonicalizing and merging it into the table.
    /// A DNS response frame also has its resolved IPs queued for
    /// `take_dns_answers`, independent of whether the frame itself yields a
    /// `FlowKey` (a response-only frame commonly carries no flow worth
    /// keeping, since `canonicalize_l7` drops the reply detail).
    pub fn ingest(&mut self, raw: &RawFlow, now_millis: i64) {
        if let Some(answer) = extract_dns_answer(raw) {
            self.dns_answers.push(answer);
        }
        match canonicalize_flow(raw) {
            Some(key) => {
                self.stats.accepted += 1;
                match self.table.get_mut(&key) {
                    Some(existing) => existing.merge(now_millis),
                    None => {
                        self.table.insert(key.clone(), FlowRecord::new(key, now_millis));
                    }
                }
            }
            None => self.stats.dropped += 1,
        }
    }

    /// Drain the DNS answers queued since the last call (§4.2 correlation
    /// feed into `ResourceResolver::record_dns`).
    pub fn take_dns_answers(&mut self) -> Vec<(String, Vec<String>)> {
        std::mem::take(&mut self.dns_answers)
    }

    pub fn ingest_many(&mut self, raws: &[RawFlow], now_millis: i64) {
        for raw in raws {
            self.ingest(raw, now_millis);
        }
    }

    /// Snapshot the table and empty it (§4.1). Called once at the start
    /// of each synthesis pass.
    pub fn snapshot(&mut self) -> Vec<FlowRecord> {
        let snapshot: Vec<FlowRecord> = self.table.values().cloned().collect();
        self.table.clear();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }
}

#[derive(Default)]
pub struct SysEventIngestor {
    table: HashMap<SysEventKey, SysEventRecord>,
    stats: IngestStats,
}

impl SysEventIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, raw: &RawSysEvent, now_millis: i64) {
        match canonicalize_sys_event(raw) {
            Some(key) => {
                self.stats.accepted += 1;
                match self.table.get_mut(&key) {
                    Some(existing) => existing.merge(now_millis),
                    None => {
                        self.table
                            .insert(key.clone(), SysEventRecord::new(key, now_millis));
                    }
                }
            }
            None => self.stats.dropped += 1,
        }
    }

    pub fn ingest_many(&mut self, raws: &[RawSysEvent], now_millis: i64) {
        for raw in raws {
            self.ingest(raw, now_millis);
        }
    }

    pub fn snapshot(&mut self) -> Vec<SysEventRecord> {
        let snapshot: Vec<SysEventRecord> = self.table.values().cloned().collect();
        self.table.clear();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }
}

/// Retry transport errors with exponential backoff, capped at 60s
/// (§4.1 Failure semantics, §7 Transient). Malformed records never reach
/// here — they are dropped by the canonicalizers above and counted.
pub async fn query_with_backoff<T, F, Fut>(mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut backoff = std::time::Duration::from_secs(1);
    let max_backoff = std::time::Duration::from_secs(60);
    let mut last_err = None;
    for _ in 0..5 {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "transient log-source error, retrying");
                last_err = Some(e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("log source query failed with no error detail")))
}
