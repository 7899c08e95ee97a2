// tests/integration/test_helpers.rs

//! Shared fixtures: a small four-node cluster with one partition.

use lodestar::config::{
    AccountingConfig, Config, ControllerConfig, MetricsConfig, NodeDef, PartitionDef,
    PowerSaveConfig, PreemptConfig, SelectBackend,
};
use lodestar::core::state::SharedState;
use lodestar::core::types::job::{Job, JobDetails, JobState};
use lodestar::core::types::node::BaseState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn node_def(names: &str, cpus: u16, features: &[&str]) -> NodeDef {
    NodeDef {
        names: names.to_string(),
        cpus,
        sockets: 1,
        cores_per_socket: cpus,
        threads_per_core: 1,
        real_memory: 4096,
        tmp_disk: 0,
        weight: 1,
        features: features.iter().map(|s| s.to_string()).collect(),
        changeable_features: vec![],
        gres: vec![],
        cloud: false,
    }
}

pub fn partition_def(name: &str, nodes: &str) -> PartitionDef {
    PartitionDef {
        name: name.to_string(),
        nodes: nodes.to_string(),
        default: true,
        min_nodes: 1,
        max_nodes: None,
        max_time: None,
        default_time: None,
        priority_tier: 0,
        priority_job_factor: 1,
        max_share: "NO".to_string(),
        preempt_mode: None,
        allow_accounts: vec![],
        deny_accounts: vec![],
        allow_qos: vec![],
        deny_qos: vec![],
        allow_groups: vec![],
        allow_alloc_nodes: vec![],
        qos: None,
        billing_weights: None,
        exclusive_user: false,
    }
}

pub fn test_config(state_dir: &Path, nodes: Vec<NodeDef>, partitions: Vec<PartitionDef>) -> Config {
    Config {
        cluster_name: "testcluster".into(),
        log_level: "info".into(),
        controllers: vec![ControllerConfig {
            hostname: "ctl1".into(),
            addr: "127.0.0.1:17817".into(),
        }],
        this_hostname: Some("ctl1".into()),
        state_save_location: state_dir.display().to_string(),
        heartbeat_interval: Duration::from_secs(5),
        controller_timeout: Duration::from_secs(60),
        msg_timeout: Duration::from_secs(10),
        licenses: None,
        ignore_state_errors: false,
        select_backend: SelectBackend::ConsumableTres,
        preempt: PreemptConfig::default(),
        accounting: AccountingConfig::default(),
        power_save: PowerSaveConfig::default(),
        metrics: MetricsConfig::default(),
        nodes,
        partitions,
    }
}

/// A default cluster: n[1-4], 4 CPUs each, one default partition.
pub fn default_cluster(state_dir: &Path) -> Config {
    test_config(
        state_dir,
        vec![node_def("n[1-4]", 4, &[])],
        vec![partition_def("batch", "n[1-4]")],
    )
}

pub fn build_state(config: Config) -> Arc<SharedState> {
    let handle = lodestar::server::detached_log_handle();
    SharedState::initialize(config, handle).unwrap().state
}

/// Simulates first registration: every node reports in healthy and idle.
pub fn mark_all_idle(state: &Arc<SharedState>) {
    let mut nodes = state.nodes.write();
    for node in nodes.iter_mut() {
        node.state.transition(BaseState::Idle).unwrap();
    }
    nodes.rebuild_bitmaps();
}

/// A pending job asking for `min_nodes` nodes and `num_tasks` single-CPU tasks.
pub fn pending_job(id: u32, min_nodes: u32, num_tasks: u32) -> Job {
    Job {
        id,
        user_id: 1000,
        state: JobState::Pending,
        details: JobDetails {
            min_nodes,
            min_cpus: num_tasks,
            cpus_per_task: 1,
            num_tasks: Some(num_tasks),
            ..Default::default()
        },
        submit_time: chrono::Utc::now().timestamp(),
        ..Default::default()
    }
}

/// Submits through the admission path, resolving any license request
/// against the ledger.
pub fn submit(state: &Arc<SharedState>, job: Job) {
    state.submit_job(job, true).unwrap();
}
