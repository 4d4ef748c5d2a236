use std::sync::Mutex;

use autopol::ingest::{RawFlow, RawSysEvent};
use autopol::resolver::{EndpointsInfo, PodInfo, ResourceProvider, ServiceInfo};
use autopol::types::{Direction, LabelMap, Protocol, SysOperation, SysResult};

pub fn labels(pairs: &[(&str, &str)]) -> LabelMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// An egress flow from `src_ip`/`src_workload` to `dst_ip`/`dst_workload`
/// on `dst_port`, allowed, TCP — the common case most synthesis tests
/// start from.
pub fn make_flow(src_ip: &str, src_workload: &str, dst_ip: &str, dst_workload: &str, dst_port: u16) -> RawFlow {
    RawFlow {
        direction: Some(Direction::Egress),
        verdict: Some("allow".to_string()),
        src_ip: Some(src_ip.to_string()),
        dst_ip: Some(dst_ip.to_string()),
        src_workload: src_workload.to_string(),
        dst_workload: dst_workload.to_string(),
        src_namespace: "default".to_string(),
        dst_namespace: "default".to_string(),
        protocol: Some(Protocol::Tcp),
        dst_port,
        ..Default::default()
    }
}

pub fn make_sys_event(cluster: &str, namespace: &str, pod: &str, source: &str, resource: &str) -> RawSysEvent {
    RawSysEvent {
        cluster: cluster.to_string(),
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        container: "main".to_string(),
        source: source.to_string(),
        resource: resource.to_string(),
        operation: Some(SysOperation::Process),
        action: "Allow".to_string(),
        result: Some(SysResult::Passed),
        ..Default::default()
    }
}

/// In-memory `ResourceProvider` backed by whatever pods/namespaces a test
/// registers, so worker/resolver-level tests don't need a real cluster.
#[derive(Default)]
pub struct FixtureProvider {
    pods: Mutex<Vec<PodInfo>>,
    services: Mutex<Vec<ServiceInfo>>,
    endpoints: Mutex<Vec<EndpointsInfo>>,
    namespaces: Mutex<Vec<String>>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod(self, name: &str, namespace: &str, ip: &str, pod_labels: &[(&str, &str)]) -> Self {
        self.pods.lock().unwrap().push(PodInfo {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ip: Some(ip.to_string()),
            labels: labels(pod_labels),
        });
        self
    }

    pub fn with_namespace(self, namespace: &str) -> Self {
        self.namespaces.lock().unwrap().push(namespace.to_string());
        self
    }
}

#[async_trait::async_trait]
impl ResourceProvider for FixtureProvider {
    async fn get_pods(&self, _cluster: &str) -> anyhow::Result<Vec<PodInfo>> {
        Ok(self.pods.lock().unwrap().clone())
    }
    async fn get_services(&self, _cluster: &str) -> anyhow::Result<Vec<ServiceInfo>> {
        Ok(self.services.lock().unwrap().clone())
    }
    async fn get_endpoints(&self, _cluster: &str) -> anyhow::Result<Vec<EndpointsInfo>> {
        Ok(self.endpoints.lock().unwrap().clone())
    }
    async fn get_namespaces(&self, _cluster: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.namespaces.lock().unwrap().clone())
    }
}
