mod common;

use common::make_sys_event;

use autopol::config::Config;
use autopol::ingest::SysEventIngestor;
use autopol::syspolicy::SystemPolicySynthesizer;
use autopol::types::{PolicyBody, PolicyStatus};

// End-to-end C1 -> C5 pipeline: raw system events in, system Policy structs out.

#[tokio::test]
async fn two_sources_for_the_same_process_produce_two_policies() {
    let mut ingestor = SysEventIngestor::new();
    ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/cat"), 1000);
    ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/sh", "/bin/cat"), 1000);
    let events = ingestor.snapshot();

    let mut synth = SystemPolicySynthesizer::new();
    let config = Config::default();
    let policies = synth.synthesize("c1", &events, &config, 1000);

    assert_eq!(policies.len(), 2, "distinct fromSource ancestry should yield distinct policies");
    let sources: Vec<String> = policies
        .iter()
        .map(|p| match &p.spec {
            PolicyBody::System(rs) => rs.from_source.clone(),
            _ => panic!("expected system policy"),
        })
        .collect();
    assert!(sources.contains(&"/bin/bash".to_string()));
    assert!(sources.contains(&"/bin/sh".to_string()));
}

#[tokio::test]
async fn repeated_observations_widen_the_same_bucket() {
    let mut ingestor = SysEventIngestor::new();
    ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/cat"), 1000);
    ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/ls"), 1000);
    let events = ingestor.snapshot();

    let mut synth = SystemPolicySynthesizer::new();
    let config = Config::default();
    let policies = synth.synthesize("c1", &events, &config, 1000);

    assert_eq!(policies.len(), 1);
    let PolicyBody::System(rs) = &policies[0].spec else { panic!("expected system policy") };
    assert_eq!(rs.match_process_paths.len(), 2);
    assert_eq!(policies[0].status, PolicyStatus::Latest);
}

#[tokio::test]
async fn file_and_process_resources_land_in_separate_sets() {
    let mut ingestor = SysEventIngestor::new();
    let mut proc_event = make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/cat");
    proc_event.operation = Some(autopol::types::SysOperation::Process);
    let mut file_event = make_sys_event("c1", "default", "web-0", "/bin/bash", "/etc/passwd");
    file_event.operation = Some(autopol::types::SysOperation::File);

    ingestor.ingest(&proc_event, 1000);
    ingestor.ingest(&file_event, 1000);
    let events = ingestor.snapshot();

    let mut synth = SystemPolicySynthesizer::new();
    let config = Config::default();
    let policies = synth.synthesize("c1", &events, &config, 1000);

    assert_eq!(policies.len(), 2, "process and file grants are emitted as distinct settype policies");
    let process_policy = policies
        .iter()
        .find(|p| matches!(&p.spec, PolicyBody::System(rs) if !rs.match_process_paths.is_empty()))
        .expect("a process-settype policy");
    let file_policy = policies
        .iter()
        .find(|p| matches!(&p.spec, PolicyBody::System(rs) if !rs.match_file_paths.is_empty()))
        .expect("a file-settype policy");
    let PolicyBody::System(rs) = &process_policy.spec else { unreachable!() };
    assert_eq!(rs.match_process_paths, vec!["/bin/cat".to_string()]);
    assert!(rs.match_file_paths.is_empty());
    let PolicyBody::System(rs) = &file_policy.spec else { unreachable!() };
    assert_eq!(rs.match_file_paths, vec!["/etc/passwd".to_string()]);
    assert!(rs.match_process_paths.is_empty());
}

#[tokio::test]
async fn bucket_widens_across_separate_ticks_and_retains_earlier_entries() {
    // Unlike `repeated_observations_widen_the_same_bucket`, this drives two
    // fully separate ingest -> snapshot -> synthesize passes, matching what
    // `DiscoveryWorker::tick` actually does once per cron interval.
    let mut synth = SystemPolicySynthesizer::new();
    let config = Config::default();

    let mut first_ingestor = SysEventIngestor::new();
    first_ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/cat"), 1000);
    let first_events = first_ingestor.snapshot();
    let first_tick = synth.synthesize("c1", &first_events, &config, 1000);
    assert_eq!(first_tick.len(), 1);
    let PolicyBody::System(rs) = &first_tick[0].spec else { panic!("expected system policy") };
    assert_eq!(rs.match_process_paths, vec!["/bin/cat".to_string()]);

    // Second tick observes only /bin/ls; /bin/cat is absent from this
    // snapshot but must still be present in the emitted allow-list.
    let mut second_ingestor = SysEventIngestor::new();
    second_ingestor.ingest(&make_sys_event("c1", "default", "web-0", "/bin/bash", "/bin/ls"), 2000);
    let second_events = second_ingestor.snapshot();
    let second_tick = synth.synthesize("c1", &second_events, &config, 2000);

    assert_eq!(second_tick.len(), 1, "the same bucket should still yield exactly one policy");
    assert_eq!(second_tick[0].name, first_tick[0].name, "bucket identity is stable across ticks");
    let PolicyBody::System(rs) = &second_tick[0].spec else { panic!("expected system policy") };
    assert_eq!(
        rs.match_process_paths,
        vec!["/bin/cat".to_string(), "/bin/ls".to_string()],
        "the second tick's policy must retain /bin/cat from the first tick, not just the current snapshot"
    );
    assert_eq!(second_tick[0].generated_at, 2000, "generated_at reflects the tick that produced this revision");
}
