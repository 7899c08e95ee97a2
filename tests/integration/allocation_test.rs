// tests/integration/allocation_test.rs

use super::test_helpers::*;
use lodestar::config::SelectBackend;
use lodestar::core::LodestarError;
use lodestar::core::license::parse_license_spec;
use lodestar::core::sched::allocate::deallocate_nodes;
use lodestar::core::sched::select_nodes_for_job;
use lodestar::core::types::job::{JobState, StateReason};
use lodestar::core::types::node::BaseState;

// Four idle 4-CPU nodes; a job wanting 2 nodes and 4 single-CPU tasks gets
// the first two, they go ALLOC, and the available bitmap shrinks by two.
#[test]
fn test_simple_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    submit(&state, pending_job(1, 2, 4));

    let sel = select_nodes_for_job(&state, 1, false, SelectBackend::ConsumableTres, false)
        .expect("allocation should succeed");
    assert_eq!(sel.partition, "batch");
    assert_eq!(sel.node_bitmap.iter_ones().collect::<Vec<_>>(), vec![0, 1]);

    let nodes = state.nodes.read();
    for idx in [0usize, 1] {
        assert_eq!(nodes.get(idx as u32).unwrap().state.base, BaseState::Alloc);
        assert!(!nodes.bitmaps.avail.test(idx));
        assert!(!nodes.bitmaps.idle.test(idx));
    }
    assert!(nodes.bitmaps.avail.test(2));
    assert!(nodes.bitmaps.avail.test(3));
    drop(nodes);

    let jobs = state.jobs.read();
    let job = jobs.find(1).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.start_time.is_some());
}

#[test]
fn test_deallocate_restores_idle() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    submit(&state, pending_job(2, 2, 2));

    select_nodes_for_job(&state, 2, false, SelectBackend::ConsumableTres, false).unwrap();
    deallocate_nodes(&state, 2).unwrap();

    let nodes = state.nodes.read();
    assert_eq!(nodes.bitmaps.idle.count(), 4);
    assert_eq!(nodes.bitmaps.avail.count(), 4);
    for idx in 0..4u32 {
        assert_eq!(nodes.get(idx).unwrap().state.base, BaseState::Idle);
        assert_eq!(nodes.get(idx).unwrap().run_jobs, 0);
    }
    drop(nodes);

    let jobs = state.jobs.read();
    assert_eq!(jobs.find(2).unwrap().state, JobState::Complete);
}

// Exclusive feature alternatives: [gpu*1|fpga*1] with two nodes must take
// exactly one gpu node and one fpga node, never two of a kind.
#[test]
fn test_feature_exclusive_counts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        dir.path(),
        vec![
            node_def("n[1-2]", 4, &["gpu"]),
            node_def("n[3-4]", 4, &["fpga"]),
        ],
        vec![partition_def("batch", "n[1-4]")],
    );
    let state = build_state(config);
    mark_all_idle(&state);

    let mut job = pending_job(3, 2, 2);
    job.details.features = Some("[gpu*1|fpga*1]".to_string());
    submit(&state, job);

    let sel = select_nodes_for_job(&state, 3, false, SelectBackend::ConsumableTres, false)
        .expect("exclusive-feature allocation should succeed");
    let chosen: Vec<usize> = sel.node_bitmap.iter_ones().collect();
    assert_eq!(chosen.len(), 2);
    let gpu_count = chosen.iter().filter(|&&i| i < 2).count();
    let fpga_count = chosen.iter().filter(|&&i| i >= 2).count();
    assert_eq!(gpu_count, 1, "exactly one gpu node expected, got {chosen:?}");
    assert_eq!(fpga_count, 1, "exactly one fpga node expected, got {chosen:?}");
}

#[test]
fn test_busy_cluster_reports_nodes_busy() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);

    submit(&state, pending_job(4, 4, 4));
    select_nodes_for_job(&state, 4, false, SelectBackend::ConsumableTres, false).unwrap();

    submit(&state, pending_job(5, 1, 1));
    let err = select_nodes_for_job(&state, 5, false, SelectBackend::ConsumableTres, false)
        .unwrap_err();
    assert_eq!(err, LodestarError::NodesBusy);
    assert_eq!(
        state.jobs.read().find(5).unwrap().state_reason,
        StateReason::Resources
    );
}

#[test]
fn test_impossible_request_never_runnable() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);

    // Five nodes can never come out of a four-node partition.
    submit(&state, pending_job(6, 5, 5));
    let err = select_nodes_for_job(&state, 6, false, SelectBackend::ConsumableTres, false)
        .unwrap_err();
    assert_eq!(err, LodestarError::InvalidNodeCount);
}

#[test]
fn test_license_shortfall_surfaces_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = default_cluster(dir.path());
    config.licenses = Some("lic:1".to_string());
    let state = build_state(config);
    mark_all_idle(&state);

    let mut holder = pending_job(7, 1, 1);
    holder.details.licenses = Some("lic:1".to_string());
    submit(&state, holder);
    assert_eq!(
        state.jobs.read().find(7).unwrap().license_list,
        parse_license_spec("lic:1").unwrap()
    );
    select_nodes_for_job(&state, 7, false, SelectBackend::ConsumableTres, false).unwrap();

    let mut blocked = pending_job(8, 1, 1);
    blocked.details.licenses = Some("lic:1".to_string());
    submit(&state, blocked);
    let err = select_nodes_for_job(&state, 8, false, SelectBackend::ConsumableTres, false)
        .unwrap_err();
    assert_eq!(err, LodestarError::LicensesUnavailable);
    assert_eq!(
        state.jobs.read().find(8).unwrap().state_reason,
        StateReason::Licenses
    );
}

// Admission resolves the raw license request: unknown names reject the job
// outright, except on restore where they are dropped instead.
#[test]
fn test_submit_validates_license_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = default_cluster(dir.path());
    config.licenses = Some("lic:1".to_string());
    let state = build_state(config);

    let mut bogus = pending_job(10, 1, 1);
    bogus.details.licenses = Some("ghost:2".to_string());
    let err = state.submit_job(bogus, true).unwrap_err();
    assert_eq!(err, LodestarError::LicenseUnknown("ghost".into()));
    assert!(state.jobs.read().find(10).is_none());

    // Restore path: the unknown name is dropped, the known one survives.
    let mut restored = pending_job(11, 1, 1);
    restored.details.licenses = Some("ghost:2,lic:1".to_string());
    state.submit_job(restored, false).unwrap();
    let jobs = state.jobs.read();
    assert_eq!(
        jobs.find(11).unwrap().license_list,
        parse_license_spec("lic:1").unwrap()
    );
}

#[test]
fn test_test_only_probe_does_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    submit(&state, pending_job(9, 2, 2));

    select_nodes_for_job(&state, 9, true, SelectBackend::ConsumableTres, false).unwrap();

    let jobs = state.jobs.read();
    assert_eq!(jobs.find(9).unwrap().state, JobState::Pending);
    drop(jobs);
    assert_eq!(state.nodes.read().bitmaps.idle.count(), 4);
}
