use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::FutureExt;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::bus::PublishBus;
use crate::config::Config;
use crate::ingest::{FlowIngestor, SysEventIngestor};
use crate::netpolicy::NetworkPolicySynthesizer;
use crate::resolver::{ResourceProvider, ResourceResolver};
use crate::store::{PolicyQuery, PolicyStore};
use crate::syspolicy::SystemPolicySynthesizer;
use crate::types::{Policy, PolicyBody};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static TICKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("autopol_discovery_ticks_total", "Total discovery ticks run")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static TICK_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("autopol_discovery_tick_errors_total", "Total discovery ticks that panicked or errored")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static POLICIES_SYNTHESIZED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("autopol_policies_synthesized", "Policies synthesized on the most recent tick")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static TICK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new("autopol_tick_duration_seconds", "Discovery tick duration"))
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub fn registry() -> &'static Registry {
    &REGISTRY
}

/* ============================= STATE MACHINE ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub tick_count: u64,
    pub last_tick_started_at: Option<i64>,
    pub last_tick_completed_at: Option<i64>,
    pub last_tick_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    /// Policies newly inserted (not previously present under that name) on
    /// the most recent tick (§4.8 GetStatus "counts discovered").
    pub last_tick_policies_discovered: u64,
    /// Policies marked outdated by a wider successor on the most recent
    /// tick (§4.8 GetStatus "counts superseded").
    pub last_tick_policies_superseded: u64,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Idle,
            tick_count: 0,
            last_tick_started_at: None,
            last_tick_completed_at: None,
            last_tick_duration_ms: None,
            last_error: None,
            last_tick_policies_discovered: 0,
            last_tick_policies_superseded: 0,
        }
    }
}

/// Parse a `cron_job_time_interval` string of the form `@every <duration>`
/// (§6), e.g. `@every 1h`, `@every 30m`, `@every 45s`.
pub fn parse_every_interval(spec: &str) -> anyhow::Result<Duration> {
    let rest = spec
        .strip_prefix("@every ")
        .ok_or_else(|| anyhow::anyhow!("unsupported cron_job_time_interval: {spec}"))?
        .trim();
    let (digits, unit) = rest.split_at(rest.len() - 1);
    let n: u64 = digits.parse().map_err(|_| anyhow::anyhow!("invalid duration in {spec}"))?;
    let duration = match unit {
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        other => anyhow::bail!("unsupported duration unit '{other}' in {spec}"),
    };
    Ok(duration)
}

/// C8 Discovery Worker: owns one cluster's ingestion/resolution/synthesis
/// pipeline and drives it on a cron or one-shot schedule (§4.8).
///
/// Network and system discovery run as independent worker instances
/// sharing only the `Config`/`PolicyStore`/`PublishBus`, matching §4.8's
/// "independent network/system worker instances" requirement.
pub struct DiscoveryWorker {
    cluster: String,
    config: Config,
    provider: Arc<dyn ResourceProvider>,
    resolver: Mutex<ResourceResolver>,
    flow_ingestor: Mutex<FlowIngestor>,
    sys_ingestor: Mutex<SysEventIngestor>,
    net_synth: Mutex<NetworkPolicySynthesizer>,
    sys_synth: Mutex<SystemPolicySynthesizer>,
    store: Arc<dyn PolicyStore>,
    bus: Arc<PublishBus>,
    status: Arc<Mutex<WorkerStatus>>,
    in_flight: Arc<AtomicU64>,
}

impl DiscoveryWorker {
    pub fn new(
        cluster: &str,
        config: Config,
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn PolicyStore>,
        bus: Arc<PublishBus>,
    ) -> Self {
        let dns_cache_capacity = config.dns_cache_capacity;
        Self {
            cluster: cluster.to_string(),
            config,
            provider,
            resolver: Mutex::new(ResourceResolver::new(cluster, dns_cache_capacity)),
            flow_ingestor: Mutex::new(FlowIngestor::new()),
            sys_ingestor: Mutex::new(SysEventIngestor::new()),
            net_synth: Mutex::new(NetworkPolicySynthesizer::new()),
            sys_synth: Mutex::new(SystemPolicySynthesizer::new()),
            store,
            bus,
            status: Arc::new(Mutex::new(WorkerStatus::default())),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        self.status.lock().await.clone()
    }

    pub async fn ingest_flow(&self, raw: &crate::ingest::RawFlow, now_millis: i64) {
        self.flow_ingestor.lock().await.ingest(raw, now_millis);
    }

    pub async fn ingest_sys_event(&self, raw: &crate::ingest::RawSysEvent, now_millis: i64) {
        self.sys_ingestor.lock().await.ingest(raw, now_millis);
    }

    /// Run the worker's schedule until `shutdown` fires. One-shot mode
    /// ticks once and returns; cron mode ticks on the configured interval,
    /// skipping any tick that would overlap a still-running one (§4.8
    /// at-most-one-tick-at-a-time, late-tick-skip).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        if self.config.operation_mode == crate::config::OperationMode::OneShot {
            self.tick_guarded(now_millis()).await;
            return Ok(());
        }

        let interval = parse_every_interval(&self.config.cron_job_time_interval)?;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let mut status = self.status.lock().await;
                    status.state = WorkerState::Stopping;
                    info!(cluster = %self.cluster, "worker_stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.in_flight.load(Ordering::SeqCst) > 0 {
                        warn!(cluster = %self.cluster, "tick_skipped_overlap");
                        continue;
                    }
                    self.tick_guarded(now_millis()).await;
                }
            }
        }
    }

    /// Run exactly one tick now, regardless of schedule (manual trigger).
    pub async fn trigger_now(&self) {
        self.tick_guarded(now_millis()).await;
    }

    async fn tick_guarded(&self, now: i64) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        {
            let mut status = self.status.lock().await;
            status.state = WorkerState::Running;
            status.last_tick_started_at = Some(now);
        }

        let timer = TICK_DURATION.start_timer();
        let result = AssertUnwindSafe(self.tick(now)).catch_unwind().await;
        let duration = timer.stop_and_record();
        TICKS_TOTAL.inc();

        let mut status = self.status.lock().await;
        status.state = WorkerState::Idle;
        status.last_tick_completed_at = Some(now);
        status.last_tick_duration_ms = Some((duration * 1000.0) as i64);
        status.tick_count += 1;

        match result {
            Ok(Ok(tick_result)) => {
                POLICIES_SYNTHESIZED.set(tick_result.total as i64);
                status.last_tick_policies_discovered = tick_result.discovered;
                status.last_tick_policies_superseded = tick_result.superseded;
                status.last_error = None;
                info!(cluster = %self.cluster, policies = tick_result.total, "tick_completed");
            }
            Ok(Err(e)) => {
                TICK_ERRORS_TOTAL.inc();
                status.last_error = Some(e.to_string());
                warn!(cluster = %self.cluster, error = %e, "tick_failed");
            }
            Err(panic) => {
                TICK_ERRORS_TOTAL.inc();
                let message = panic_message(&panic);
                status.last_error = Some(message.clone());
                error!(cluster = %self.cluster, error = %message, "tick_panicked");
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn tick(&self, now: i64) -> anyhow::Result<TickResult> {
        info!(cluster = %self.cluster, "tick_started");

        self.resolver.lock().await.refresh(self.provider.as_ref()).await?;

        let (flows, dns_answers) = {
            let mut ingestor = self.flow_ingestor.lock().await;
            let flows = ingestor.snapshot();
            let dns_answers = ingestor.take_dns_answers();
            (flows, dns_answers)
        };
        let events = self.sys_ingestor.lock().await.snapshot();

        let resolver = {
            let mut resolver = self.resolver.lock().await;
            for (query, ips) in dns_answers {
                resolver.record_dns(&query, ips);
            }
            resolver
        };
        let net_policies = self
            .net_synth
            .lock()
            .await
            .synthesize(&self.cluster, &flows, &resolver, &self.config, now);
        drop(resolver);

        let sys_policies = self
            .sys_synth
            .lock()
            .await
            .synthesize(&self.cluster, &events, &self.config, now);

        let mut all_policies = net_policies;
        all_policies.extend(sys_policies);

        let (discovered, superseded) = self.store_and_publish(&all_policies).await?;

        Ok(TickResult { total: all_policies.len(), discovered, superseded })
    }

    /// Returns (policies newly inserted, policies marked outdated).
    async fn store_and_publish(&self, policies: &[Policy]) -> anyhow::Result<(u64, u64)> {
        let mut discovered = 0;
        let mut superseded = 0;
        for policy in policies {
            superseded += self.supersede_existing(policy).await?;
            if self.store.insert_or_update(policy.clone()).await? {
                discovered += 1;
            }
        }
        self.bus.publish(policies).await;
        Ok((discovered, superseded))
    }

    async fn supersede_existing(&self, incoming: &Policy) -> anyhow::Result<u64> {
        let query = PolicyQuery {
            cluster: Some(incoming.cluster.clone()),
            namespace: Some(incoming.namespace.clone()),
            kind: Some(incoming.kind),
            ..Default::default()
        };
        let existing = self.store.query(&query).await?;
        let mut superseded = 0;
        for candidate in existing {
            if candidate.name == incoming.name {
                continue;
            }
            let is_superseded = match (&candidate.spec, &incoming.spec) {
                (PolicyBody::Network(old), PolicyBody::Network(new)) => old.is_strict_subset_of(new),
                (PolicyBody::System(old), PolicyBody::System(new)) => {
                    self.config.deprecate_old_system_mode && old.is_subset_of(new)
                }
                _ => false,
            };
            if is_superseded {
                self.store.mark_outdated(&candidate.name, &incoming.name).await?;
                superseded += 1;
            }
        }
        Ok(superseded)
    }
}

struct TickResult {
    total: usize,
    discovered: u64,
    superseded: u64,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "discovery tick panicked with a non-string payload".to_string()
    }
}
