use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::Config;
use crate::types::{
    stable_hash_hex, LabelMap, Policy, PolicyBody, PolicyKind, PolicyStatus, SysEventRecord,
    SysOperation, SysResult, SystemRuleSet, Workload,
};

/// Per-`(workload, container, fromSource)` accumulator (§4.5 C5 System
/// Policy Synthesizer). Widens append-only as new process/file resources
/// are observed for the same bucket. Process and file resources are kept
/// in separate sets so they can be emitted as distinct `settype` policies.
#[derive(Debug, Default)]
struct SystemBucket {
    process_paths: BTreeSet<String>,
    file_paths: BTreeSet<String>,
    process_event_hashes: BTreeSet<String>,
    file_event_hashes: BTreeSet<String>,
}

/// C5 System Policy Synthesizer. Owns the per-`(workload, container,
/// fromSource)` buckets across ticks so filesets widen rather than reset
/// (§4.5: "Re-runs either update the fileset (append new entries only;
/// prior set is preserved)..."). A bucket observed in an earlier tick but
/// absent from the current one still appears in the emitted policy,
/// matching the §8 monotonicity law `syscalls_observed ⊆ syscalls_emitted`.
/// Keyed by `(workload.key(), container, fromSource)` — §4.5's full keying
/// tuple `(cluster, namespace, container, labels, fromSource, settype)`
/// minus `settype`, since a single bucket's process/file sets are split
/// into distinct settype policies at emission time rather than at
/// accumulation time.
#[derive(Default)]
pub struct SystemPolicySynthesizer {
    buckets: HashMap<(String, String, String), (Workload, SystemBucket)>,
}

impl SystemPolicySynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesize system (process/file allow-list) policies, merging one
    /// tick's event snapshot into the accumulated per-bucket state and
    /// emitting a policy for every bucket observed so far.
    pub fn synthesize(&mut self, cluster: &str, events: &[SysEventRecord], config: &Config, now: i64) -> Vec<Policy> {
        for record in events {
            let key = &record.key;
            if key.result != SysResult::Passed {
                // Only passed operations establish an allow-list entry;
                // failed/blocked attempts carry no grant to synthesize.
                continue;
            }
            if !config.namespace_allowed(&key.namespace) {
                continue;
            }

            let workload = Workload::new(cluster, &key.namespace, &key.labels);
            let workload_key = workload.key();
            let bucket_key = (workload_key, key.container.clone(), key.source.clone());

            let entry = self
                .buckets
                .entry(bucket_key)
                .or_insert_with(|| (workload.clone(), SystemBucket::default()));
            entry.0 = workload;

            let hash = stable_hash_hex(key)[..15].to_string();
            match key.operation {
                SysOperation::Process => {
                    entry.1.process_paths.insert(key.resource.clone());
                    entry.1.process_event_hashes.insert(hash);
                }
                SysOperation::File => {
                    entry.1.file_paths.insert(key.resource.clone());
                    entry.1.file_event_hashes.insert(hash);
                }
                SysOperation::Network => {
                    // Network-originated system events correlate with C4's
                    // flow-based synthesis and carry no process/file grant
                    // of their own.
                }
            }
        }

        let mut policies = Vec::new();
        for ((_, container, from_source), (workload, bucket)) in &self.buckets {
            if !bucket.process_paths.is_empty() {
                policies.push(Self::emit(
                    cluster,
                    workload,
                    container,
                    from_source,
                    SysOperation::Process,
                    bucket.process_paths.iter().cloned().collect(),
                    Vec::new(),
                    &bucket.process_event_hashes,
                    now,
                ));
            }
            if !bucket.file_paths.is_empty() {
                policies.push(Self::emit(
                    cluster,
                    workload,
                    container,
                    from_source,
                    SysOperation::File,
                    Vec::new(),
                    bucket.file_paths.iter().cloned().collect(),
                    &bucket.file_event_hashes,
                    now,
                ));
            }
        }

        debug!(policies = policies.len(), "system policies synthesized");
        policies
    }

    /// Build one settype-scoped `Policy` from a bucket's accumulated state.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        cluster: &str,
        workload: &Workload,
        container: &str,
        from_source: &str,
        settype: SysOperation,
        match_process_paths: Vec<String>,
        match_file_paths: Vec<String>,
        event_hashes: &BTreeSet<String>,
        now: i64,
    ) -> Policy {
        let ruleset = SystemRuleSet {
            selector: workload.normalized_labels.clone(),
            container: container.to_string(),
            from_source: from_source.to_string(),
            settype,
            match_process_paths,
            match_file_paths,
        };
        let name = Policy::system_name(&ruleset);
        Policy {
            kind: PolicyKind::System,
            api_version: "autopol.accuknox.io/v1".to_string(),
            name,
            cluster: cluster.to_string(),
            namespace: workload.namespace.clone(),
            rule_type: "matchLabels".to_string(),
            status: PolicyStatus::Latest,
            spec: PolicyBody::System(ruleset),
            flow_ids: event_hashes.iter().cloned().collect(),
            generated_at: now,
            updated_at: now,
            outdated: None,
        }
    }

    /// Whether an existing ruleset should be marked outdated in favor of a
    /// newly synthesized one, honoring the `deprecate_old_system_mode`
    /// switch (§4.5). When the switch is off, old policies are kept
    /// alongside new ones rather than superseded.
    pub fn should_deprecate(old: &SystemRuleSet, new: &SystemRuleSet, config: &Config) -> bool {
        config.deprecate_old_system_mode && old.is_subset_of(new)
    }
}
