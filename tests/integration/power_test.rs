// tests/integration/power_test.rs

use super::test_helpers::*;
use lodestar::config::PowerSaveConfig;
use lodestar::core::power::script::{ScriptKind, ScriptRunner, ScriptSpec};
use lodestar::core::power::{PowerSaveManager, ResumeRequest, TokenBucket};
use lodestar::core::types::bitmap::NodeBitmap;
use lodestar::core::types::node::{BaseState, NodeFlags};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingRunner {
    specs: Mutex<Vec<ScriptSpec>>,
}

impl RecordingRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            specs: Mutex::new(Vec::new()),
        })
    }

    fn taken(&self) -> Vec<ScriptSpec> {
        self.specs.lock().unwrap().drain(..).collect()
    }
}

impl ScriptRunner for RecordingRunner {
    fn spawn(&self, spec: ScriptSpec) {
        self.specs.lock().unwrap().push(spec);
    }
}

fn power_config() -> PowerSaveConfig {
    PowerSaveConfig {
        suspend_program: Some("/usr/local/bin/suspend.sh".into()),
        resume_program: Some("/usr/local/bin/resume.sh".into()),
        resume_fail_program: Some("/usr/local/bin/resume_fail.sh".into()),
        suspend_time: Duration::from_secs(60),
        suspend_timeout: Duration::from_secs(30),
        resume_timeout: Duration::from_secs(60),
        suspend_rate: 0,
        resume_rate: 0,
        suspend_exc_nodes: None,
        suspend_exc_parts: vec![],
        suspend_exc_states: vec![],
        power_save_interval: Duration::from_secs(10),
        power_save_min_interval: Duration::ZERO,
        idle_on_node_suspend: false,
    }
}

type CompletionTx = tokio::sync::mpsc::Sender<lodestar::core::power::script::ScriptCompletion>;

fn manager(
    state: &Arc<lodestar::core::state::SharedState>,
    runner: Arc<RecordingRunner>,
) -> (PowerSaveManager, CompletionTx) {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    (PowerSaveManager::new(state.clone(), runner, rx), tx)
}

#[tokio::test]
async fn test_idle_nodes_are_suspended_with_exclusions() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    {
        let mut nodes = state.nodes.write();
        let stale = chrono::Utc::now().timestamp() - 1_000;
        for node in nodes.iter_mut() {
            node.last_busy = stale;
        }
    }

    let runner = RecordingRunner::new();
    let (mgr, _completion_tx) = manager(&state, runner.clone());
    let mut ps = power_config();
    ps.suspend_exc_nodes = Some("n1".to_string());

    let mut none_resume: Option<TokenBucket> = None;
    let mut none_suspend: Option<TokenBucket> = None;
    mgr.pass(&ps, dir.path(), &mut none_resume, &mut none_suspend, &[]);

    let nodes = state.nodes.read();
    assert!(!nodes.find_by_name("n1").unwrap().state.is_powering_down());
    for name in ["n2", "n3", "n4"] {
        let node = nodes.find_by_name(name).unwrap();
        assert!(node.state.is_powering_down(), "{name} should be suspending");
        assert!(!nodes.bitmaps.avail.test(node.index as usize));
    }
    drop(nodes);

    let scripts = runner.taken();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].kind, ScriptKind::Suspend);
    assert_eq!(scripts[0].nodelist, "n[2-4]");
}

// Resume pacing: with a bucket holding exactly one token, a five-node wake
// request wakes one node per pass and requeues the rest.
#[tokio::test]
async fn test_resume_respects_token_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        dir.path(),
        vec![node_def("n[1-8]", 4, &[])],
        vec![partition_def("batch", "n[1-8]")],
    );
    let state = build_state(config);
    mark_all_idle(&state);
    {
        let mut nodes = state.nodes.write();
        for node in nodes.iter_mut() {
            node.state.set_flag(NodeFlags::POWERED_DOWN);
        }
        nodes.rebuild_bitmaps();
    }

    let mut wanted = NodeBitmap::new(8);
    for idx in 0..5 {
        wanted.set(idx);
    }
    state.resume_job_list.lock().push(ResumeRequest {
        job_id: 42,
        node_bitmap: wanted,
        features: None,
        extra: None,
    });

    let runner = RecordingRunner::new();
    let (mgr, _completion_tx) = manager(&state, runner.clone());
    let ps = power_config();

    // 6/min over a 10s interval: the bucket caps at a single token, and the
    // bucket was created at time zero so the first update fills it.
    let mut resume_bucket = TokenBucket::new(6, Duration::from_secs(10), 0);
    let mut suspend_bucket: Option<TokenBucket> = None;
    mgr.pass(&ps, dir.path(), &mut resume_bucket, &mut suspend_bucket, &[]);

    {
        let nodes = state.nodes.read();
        let powering_up = nodes
            .iter()
            .filter(|n| n.state.is_powering_up())
            .count();
        assert_eq!(powering_up, 1, "exactly one node per token");
    }
    let pending = state.resume_job_list.lock().clone();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].node_bitmap.count(), 4);

    let scripts = runner.taken();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].kind, ScriptKind::Resume);
    assert!(
        scripts[0]
            .env
            .iter()
            .any(|(k, _)| k == lodestar::core::power::script::RESUME_FILE_ENV),
        "resume script must receive the resume document path"
    );

    // Immediately after, the bucket is empty: nothing else wakes.
    mgr.pass(&ps, dir.path(), &mut resume_bucket, &mut suspend_bucket, &[]);
    let nodes = state.nodes.read();
    let powering_up = nodes.iter().filter(|n| n.state.is_powering_up()).count();
    assert_eq!(powering_up, 1);
}

#[tokio::test]
async fn test_resume_timeout_marks_node_down() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    {
        let mut nodes = state.nodes.write();
        let node = nodes.get_mut(0).unwrap();
        node.state.set_flag(NodeFlags::POWERING_UP);
        node.state.set_flag(NodeFlags::NO_RESPOND);
        node.boot_req_time = Some(chrono::Utc::now().timestamp() - 600);
        nodes.rebuild_bitmaps();
    }

    let runner = RecordingRunner::new();
    let (mgr, _completion_tx) = manager(&state, runner.clone());
    let ps = power_config();
    let mut none_resume: Option<TokenBucket> = None;
    let mut none_suspend: Option<TokenBucket> = None;
    mgr.pass(&ps, dir.path(), &mut none_resume, &mut none_suspend, &[]);

    let nodes = state.nodes.read();
    let node = nodes.get(0).unwrap();
    assert_eq!(node.state.base, BaseState::Down);
    assert_eq!(node.reason.as_deref(), Some("ResumeTimeout reached"));
    drop(nodes);

    let scripts = runner.taken();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].kind, ScriptKind::ResumeFail);
    assert_eq!(scripts[0].nodelist, "n1");
}

#[tokio::test]
async fn test_powering_down_completes_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(default_cluster(dir.path()));
    mark_all_idle(&state);
    {
        let mut nodes = state.nodes.write();
        let node = nodes.get_mut(2).unwrap();
        node.state.set_flag(NodeFlags::POWERING_DOWN);
        node.power_save_req_time = Some(chrono::Utc::now().timestamp() - 600);
        node.instance_id = Some("i-abc".into());
        nodes.rebuild_bitmaps();
    }

    let runner = RecordingRunner::new();
    let (mgr, _completion_tx) = manager(&state, runner);
    let ps = power_config();
    let mut none_resume: Option<TokenBucket> = None;
    let mut none_suspend: Option<TokenBucket> = None;
    mgr.pass(&ps, dir.path(), &mut none_resume, &mut none_suspend, &[]);

    let nodes = state.nodes.read();
    let node = nodes.get(2).unwrap();
    assert!(node.state.is_powered_down());
    assert!(!node.state.is_powering_down());
    assert!(node.instance_id.is_none());
    assert!(nodes.bitmaps.avail.test(2));
}
