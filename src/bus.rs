use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::types::{LabelMap, Policy, PolicyKind};

/// Subscriber interest filter (§4.7/§6): a consumer only receives policies
/// matching every set field.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub kinds: Vec<PolicyKind>,
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub label_subset: LabelMap,
}

impl SubscriptionFilter {
    fn matches(&self, policy: &Policy) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&policy.kind) {
            return false;
        }
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
        if !self.label_subset.is_empty() {
            let selector = match &policy.spec {
                crate::types::PolicyBody::Network(rs) => &rs.selector,
                crate::types::PolicyBody::System(rs) => &rs.selector,
            };
            if !self.label_subset.iter().all(|(k, v)| selector.get(k) == Some(v)) {
                return false;
            }
        }
        true
    }
}

struct Consumer {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Policy>,
    dropped: Arc<AtomicU64>,
}

/// Bounded per-consumer fan-out bus (§4.7 C7 Publish Bus). Each
/// `publish()` call is delivered to every matching consumer's own queue in
/// order; a slow consumer's backpressure never blocks others (bounded
/// enqueue-with-timeout, drop-counted).
pub struct PublishBus {
    consumers: Mutex<Vec<Consumer>>,
    queue_depth: usize,
    enqueue_timeout: std::time::Duration,
}

pub struct Subscription {
    pub receiver: mpsc::Receiver<Policy>,
    pub dropped: Arc<AtomicU64>,
}

impl PublishBus {
    pub fn new(queue_depth: usize, enqueue_timeout_ms: u64) -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            queue_depth: queue_depth.max(1),
            enqueue_timeout: std::time::Duration::from_millis(enqueue_timeout_ms),
        }
    }

    /// Register a new consumer and return its receiving half.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let dropped = Arc::new(AtomicU64::new(0));
        self.consumers.lock().await.push(Consumer { filter, sender: tx, dropped: dropped.clone() });
        Subscription { receiver: rx, dropped }
    }

    /// Fan a batch of synthesized policies out to every matching consumer.
    /// Delivery order is preserved per-consumer; a full queue past the
    /// enqueue timeout drops the policy for that consumer only and
    /// increments its drop counter (§5 Shared resources backpressure). Each
    /// consumer's sends run concurrently with every other consumer's —
    /// only the sends *within* one consumer are sequential — so a consumer
    /// stuck on a full queue for the whole `enqueue_timeout` never delays
    /// delivery to the rest.
    pub async fn publish(&self, policies: &[Policy]) {
        let consumers = self.consumers.lock().await;
        let deliveries = consumers.iter().map(|consumer| async move {
            for policy in policies {
                if !consumer.filter.matches(policy) {
                    continue;
                }
                match tokio::time::timeout(self.enqueue_timeout, consumer.sender.send(policy.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        consumer.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(policy = %policy.name, "publish bus consumer backpressure, dropping");
                    }
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }
}
