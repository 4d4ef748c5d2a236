use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Policy, PolicyKind, PolicyStatus};

/// Query filter for `PolicyStore::query` (§4.6/§6).
#[derive(Debug, Clone, Default)]
pub struct PolicyQuery {
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub kind: Option<PolicyKind>,
    pub rule_type: Option<String>,
    pub status: Option<PolicyStatus>,
}

impl PolicyQuery {
    fn matches(&self, policy: &Policy) -> bool {
        if let Some(cluster) = &self.cluster {
            if &policy.cluster != cluster {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if &policy.namespace != namespace {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if policy.kind != kind {
                return false;
            }
        }
        if let Some(rule_type) = &self.rule_type {
            if &policy.rule_type != rule_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if policy.status != status {
                return false;
            }
        }
        true
    }
}

/// Durable policy storage contract (§4.6/§6 C6 Policy Store). Callers
/// insert newly synthesized policies and mark superseded ones outdated;
/// the store never computes supersession itself — that's the
/// synthesizer's (C4/C5) job via `RuleSet::is_strict_subset_of` /
/// `SystemRuleSet::is_subset_of`.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Insert or overwrite `policy`. Returns `true` when no policy with
    /// this name previously existed (§4.6 "whether the row was new").
    async fn insert_or_update(&self, policy: Policy) -> anyhow::Result<bool>;
    async fn mark_outdated(&self, name: &str, superseded_by: &str) -> anyhow::Result<()>;
    async fn query(&self, filter: &PolicyQuery) -> anyhow::Result<Vec<Policy>>;
    async fn get(&self, name: &str) -> anyhow::Result<Option<Policy>>;
}

/// In-process, `RwLock`-guarded implementation (§14 Open Question
/// decision — no SQL/embedded-DB crate appears anywhere in the teacher or
/// the wider retrieval pack, so this trait is the durable contract and a
/// production deployment can swap in a SQL-backed impl without touching
/// callers).
#[derive(Clone)]
pub struct InMemoryPolicyStore {
    inner: Arc<RwLock<HashMap<String, Policy>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn insert_or_update(&self, policy: Policy) -> anyhow::Result<bool> {
        let mut guard = self.inner.write().await;
        debug!(name = %policy.name, kind = ?policy.kind, "policy stored");
        let is_new = guard.insert(policy.name.clone(), policy).is_none();
        Ok(is_new)
    }

    async fn mark_outdated(&self, name: &str, superseded_by: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.write().await;
        let policy = guard
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("no such policy: {name}"))?;
        policy.status = PolicyStatus::Outdated;
        policy.outdated = Some(superseded_by.to_string());
        Ok(())
    }

    async fn query(&self, filter: &PolicyQuery) -> anyhow::Result<Vec<Policy>> {
        let guard = self.inner.read().await;
        let mut results: Vec<Policy> = guard.values().filter(|p| filter.matches(p)).cloned().collect();
        results.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(results)
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<Policy>> {
        let guard = self.inner.read().await;
        Ok(guard.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Destination, Direction, LabelMap, PolicyBody, RuleSet};

    fn sample_policy(name: &str, updated_at: i64) -> Policy {
        Policy {
            kind: PolicyKind::Network,
            api_version: "autopol.accuknox.io/v1".to_string(),
            name: name.to_string(),
            cluster: "c1".to_string(),
            namespace: "default".to_string(),
            rule_type: "toEntities".to_string(),
            status: PolicyStatus::Latest,
            spec: PolicyBody::Network(RuleSet {
                selector: LabelMap::new(),
                direction: Direction::Egress,
                peer: Destination::Entity { name: "world".to_string() },
                ports: vec![],
                l7: None,
            }),
            flow_ids: vec![],
            generated_at: updated_at,
            updated_at,
            outdated: None,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = InMemoryPolicyStore::new();
        store.insert_or_update(sample_policy("p1", 1)).await.unwrap();
        let fetched = store.get("p1").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn insert_or_update_reports_whether_the_row_was_new() {
        let store = InMemoryPolicyStore::new();
        let was_new = store.insert_or_update(sample_policy("p1", 1)).await.unwrap();
        assert!(was_new, "first insert under this name should be new");

        let was_new_again = store.insert_or_update(sample_policy("p1", 2)).await.unwrap();
        assert!(!was_new_again, "re-inserting the same name should not be new");
    }

    #[tokio::test]
    async fn mark_outdated_updates_status() {
        let store = InMemoryPolicyStore::new();
        store.insert_or_update(sample_policy("p1", 1)).await.unwrap();
        store.mark_outdated("p1", "p2").await.unwrap();
        let fetched = store.get("p1").await.unwrap().unwrap();
        assert_eq!(fetched.status, PolicyStatus::Outdated);
        assert_eq!(fetched.outdated.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn query_orders_by_updated_at_descending() {
        let store = InMemoryPolicyStore::new();
        store.insert_or_update(sample_policy("p1", 1)).await.unwrap();
        store.insert_or_update(sample_policy("p2", 5)).await.unwrap();
        store.insert_or_update(sample_policy("p3", 3)).await.unwrap();
        let results = store.query(&PolicyQuery::default()).await.unwrap();
        let names: Vec<&str> = results.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p2", "p3", "p1"]);
    }

    #[tokio::test]
    async fn query_filters_by_namespace() {
        let store = InMemoryPolicyStore::new();
        let mut other = sample_policy("p1", 1);
        other.namespace = "staging".to_string();
        store.insert_or_update(other).await.unwrap();
        store.insert_or_update(sample_policy("p2", 2)).await.unwrap();

        let filter = PolicyQuery { namespace: Some("default".to_string()), ..Default::default() };
        let results = store.query(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "p2");
    }

    #[tokio::test]
    async fn mark_outdated_missing_policy_errors() {
        let store = InMemoryPolicyStore::new();
        let result = store.mark_outdated("nonexistent", "p2").await;
        assert!(result.is_err());
    }
}
