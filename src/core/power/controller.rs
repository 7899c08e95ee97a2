// src/core/power/controller.rs

//! The power-save loop.
//!
//! Every `power_save_interval` (or sooner when the allocation path kicks us,
//! bounded below by `power_save_min_interval`) one pass runs under the
//! node-write rail: build the avoid set, wake queued resume requests, pick
//! suspend candidates, then age out stuck transitions. Scripts launch after
//! the rail is released and never block the loop.

use super::script::{
    ResumeFile, ResumeJobRecord, RESUME_FILE_ENV, ScriptCompletion, ScriptKind, ScriptRunner,
    ScriptSpec,
};
use super::tokens::TokenBucket;
use super::ResumeRequest;
use crate::config::PowerSaveConfig;
use crate::core::metrics;
use crate::core::state::SharedState;
use crate::core::state::tables::UpdateStamps;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::hostlist;
use crate::core::types::node::{BaseState, NodeFlags, SuspendExcState, parse_exc_state};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A task responsible for node suspend/resume pacing.
pub struct PowerSaveManager {
    state: Arc<SharedState>,
    runner: Arc<dyn ScriptRunner>,
    completion_rx: mpsc::Receiver<ScriptCompletion>,
}

struct PassOutcome {
    scripts: Vec<ScriptSpec>,
}

impl PowerSaveManager {
    pub fn new(
        state: Arc<SharedState>,
        runner: Arc<dyn ScriptRunner>,
        completion_rx: mpsc::Receiver<ScriptCompletion>,
    ) -> Self {
        Self {
            state,
            runner,
            completion_rx,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let ps = self.state.config.lock().await.power_save.clone();
        let state_dir = PathBuf::from(self.state.config.lock().await.state_save_location.clone());

        let (Some(_suspend_prog), Some(_resume_prog)) =
            (ps.suspend_program.clone(), ps.resume_program.clone())
        else {
            info!("Power save will not run (no suspend/resume program configured).");
            return;
        };

        let now_ms = unix_ms();
        let mut resume_bucket =
            TokenBucket::new(ps.resume_rate, ps.power_save_interval, now_ms);
        let mut suspend_bucket =
            TokenBucket::new(ps.suspend_rate, ps.power_save_interval, now_ms);
        let exc_states: Vec<SuspendExcState> = ps
            .suspend_exc_states
            .iter()
            .filter_map(|s| parse_exc_state(s))
            .collect();

        info!(
            "Power save started: interval {:?}, suspend rate {}/min, resume rate {}/min.",
            ps.power_save_interval, ps.suspend_rate, ps.resume_rate
        );

        let mut interval = tokio::time::interval(ps.power_save_interval);
        let mut last_pass = Instant::now() - ps.power_save_interval;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    last_pass = Instant::now();
                    self.pass(&ps, &state_dir, &mut resume_bucket, &mut suspend_bucket, &exc_states);
                }
                _ = self.state.power_kick.notified() => {
                    // State changed; run sooner but respect the lower bound.
                    let since = last_pass.elapsed();
                    if since < ps.power_save_min_interval {
                        tokio::time::sleep(ps.power_save_min_interval - since).await;
                    }
                    last_pass = Instant::now();
                    self.pass(&ps, &state_dir, &mut resume_bucket, &mut suspend_bucket, &exc_states);
                }
                completion = self.completion_rx.recv() => {
                    if let Some(c) = completion {
                        self.reconcile_script(c);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Power save shutting down.");
                    return;
                }
            }
        }
    }

    /// One pass under the node-write rail. Scripts collected during the pass
    /// launch after the rail is released.
    pub fn pass(
        &self,
        ps: &PowerSaveConfig,
        state_dir: &std::path::Path,
        resume_bucket: &mut Option<TokenBucket>,
        suspend_bucket: &mut Option<TokenBucket>,
        exc_states: &[SuspendExcState],
    ) {
        let now = chrono::Utc::now().timestamp();
        let now_ms = unix_ms();
        if let Some(b) = resume_bucket.as_mut() {
            b.update(now_ms);
        }
        if let Some(b) = suspend_bucket.as_mut() {
            b.update(now_ms);
        }

        let outcome = {
            let mut requests = std::mem::take(&mut *self.state.resume_job_list.lock());
            let mut jobs_ctx = self.job_context(&requests);
            let mut nodes = self.state.nodes.write();
            let len = nodes.len();
            // No node transitions twice within one pass.
            let mut touched = NodeBitmap::new(len);
            let mut scripts = Vec::new();

            // Partition exclusions resolve through the part rail, which
            // orders above the node rail and is safe to take here.
            let exc_parts = {
                let parts = self.state.parts.read();
                let mut bm = NodeBitmap::new(len);
                for name in &ps.suspend_exc_parts {
                    match parts.find(name) {
                        Some(part) => bm.union_with(&part.node_bitmap),
                        None => warn!("suspend_exc_parts names unknown partition '{name}'"),
                    }
                }
                bm
            };
            let mut avoid = build_avoid_bitmap(&nodes, ps, now);
            avoid.union_with(&exc_parts);

            // --- Resume queued jobs ---
            let mut all_woken = NodeBitmap::new(len);
            let mut job_records: Vec<ResumeJobRecord> = Vec::new();
            let mut leftovers: Vec<ResumeRequest> = Vec::new();

            for req in requests.drain(..) {
                let mut pending = req.node_bitmap.clone();
                pending.intersect_with(&nodes.bitmaps.power_down);
                if pending.is_empty() {
                    continue;
                }
                let mut woken = NodeBitmap::new(len);
                let mut remaining = NodeBitmap::new(len);
                for idx in pending.iter_ones() {
                    let has_token = match resume_bucket.as_mut() {
                        Some(b) => b.try_spend(),
                        None => true,
                    };
                    if !has_token {
                        remaining.set(idx);
                        continue;
                    }
                    if let Some(node) = nodes.get_mut(idx as u32) {
                        node.state.clear_flag(NodeFlags::POWERED_DOWN);
                        node.state.set_flag(NodeFlags::POWER_UP);
                        node.state.set_flag(NodeFlags::POWERING_UP);
                        node.state.set_flag(NodeFlags::NO_RESPOND);
                        node.boot_req_time = Some(now);
                        woken.set(idx);
                        touched.set(idx);
                        metrics::POWER_RESUMES_TOTAL.inc();
                    }
                }
                nodes.bitmaps.power_down.difference_with(&woken);
                nodes.bitmaps.power_up.union_with(&woken);
                nodes.bitmaps.booting.union_with(&woken);

                if !woken.is_empty() {
                    let (alloc_bitmap, partition, oversubscribe, reservation) =
                        jobs_ctx.remove(&req.job_id).unwrap_or_default();
                    let nodes_alloc = alloc_bitmap
                        .map(|bm| nodes.expr_from_bitmap(&bm))
                        .unwrap_or_default();
                    job_records.push(ResumeJobRecord {
                        job_id: req.job_id,
                        extra: req.extra.clone(),
                        features: req.features.clone(),
                        nodes_alloc,
                        nodes_resume: nodes.expr_from_bitmap(&woken),
                        oversubscribe,
                        partition,
                        reservation,
                    });
                    all_woken.union_with(&woken);
                }
                if !remaining.is_empty() {
                    leftovers.push(ResumeRequest {
                        node_bitmap: remaining,
                        ..req
                    });
                }
            }

            if !all_woken.is_empty() {
                let resume_doc = ResumeFile {
                    all_nodes_resume: nodes.expr_from_bitmap(&all_woken),
                    jobs: job_records,
                };
                let mut env = Vec::new();
                match resume_doc.write(state_dir) {
                    Ok(path) => {
                        env.push((RESUME_FILE_ENV.to_string(), path.display().to_string()))
                    }
                    Err(e) => warn!("Could not write resume document: {e}"),
                }
                if let Some(prog) = &ps.resume_program {
                    scripts.push(ScriptSpec {
                        kind: ScriptKind::Resume,
                        program: PathBuf::from(prog),
                        nodelist: resume_doc.all_nodes_resume.clone(),
                        env,
                        timeout: max_script_timeout(ps),
                    });
                }
            }
            if !leftovers.is_empty() {
                self.state.resume_job_list.lock().extend(leftovers);
            }

            // --- Suspend idle candidates ---
            let mut suspended = NodeBitmap::new(len);
            for idx in 0..len {
                if touched.test(idx) || avoid.test(idx) {
                    continue;
                }
                let Some(node) = nodes.get(idx as u32) else {
                    continue;
                };
                let s = &node.state;
                let eligible_state = (s.is_idle() || s.is_down())
                    && !s.is_completing()
                    && !s.is_power_transitioning()
                    && !s.is_powered_down();
                if !eligible_state || node.suspended_jobs > 0 {
                    continue;
                }
                let asap = s
                    .flags
                    .intersects(NodeFlags::POWER_DOWN | NodeFlags::POWER_DOWN_ASAP);
                let idle_window = node
                    .suspend_time
                    .unwrap_or(ps.suspend_time)
                    .as_secs() as i64;
                if !asap && now - node.last_busy <= idle_window {
                    continue;
                }
                if exc_states.iter().any(|e| e.matches(s)) {
                    continue;
                }
                let has_token = match suspend_bucket.as_mut() {
                    Some(b) => b.try_spend(),
                    None => true,
                };
                if !has_token {
                    continue;
                }

                let node = nodes.get_mut(idx as u32).unwrap();
                node.state
                    .clear_flag(NodeFlags::POWER_DOWN | NodeFlags::POWER_DOWN_ASAP);
                node.state.set_flag(NodeFlags::POWERING_DOWN);
                node.power_save_req_time = Some(now);
                if ps.idle_on_node_suspend {
                    node.state.clear_flag(NodeFlags::DRAIN | NodeFlags::FAIL);
                    if node.state.transition(BaseState::Idle).is_err() {
                        debug!("node {}: could not reset to IDLE on suspend", node.name);
                    }
                }
                nodes.bitmaps.avail.clear(idx);
                nodes.bitmaps.power_down.set(idx);
                suspended.set(idx);
                touched.set(idx);
                metrics::POWER_SUSPENDS_TOTAL.inc();
            }

            if !suspended.is_empty() {
                if let Some(prog) = &ps.suspend_program {
                    scripts.push(ScriptSpec {
                        kind: ScriptKind::Suspend,
                        program: PathBuf::from(prog),
                        nodelist: nodes.expr_from_bitmap(&suspended),
                        env: Vec::new(),
                        timeout: max_script_timeout(ps),
                    });
                }
            }

            // --- Age out stuck transitions ---
            let mut resume_failed = NodeBitmap::new(len);
            for idx in 0..len {
                if touched.test(idx) {
                    continue;
                }
                let Some(node) = nodes.get_mut(idx as u32) else {
                    continue;
                };
                let s = node.state;
                if s.is_powering_down() {
                    let since = node.power_save_req_time.unwrap_or(now);
                    if now - since > ps.suspend_timeout.as_secs() as i64 {
                        node.state.set_flag(NodeFlags::POWERED_DOWN);
                        node.reset_after_power_down();
                        node.power_save_req_time = None;
                        nodes.bitmaps.avail.set(idx);
                        touched.set(idx);
                        debug!("node index {idx} completed power down");
                    }
                } else if s.is_powering_up()
                    && s.flags.contains(NodeFlags::NO_RESPOND)
                {
                    let since = node.boot_req_time.unwrap_or(now);
                    if now - since > ps.resume_timeout.as_secs() as i64 {
                        node.state
                            .clear_flag(NodeFlags::POWERING_UP | NodeFlags::POWER_UP);
                        if let Err(e) = node.state.transition(BaseState::Down) {
                            warn!("node {}: {e}", node.name);
                        }
                        node.reason = Some("ResumeTimeout reached".to_string());
                        nodes.bitmaps.avail.clear(idx);
                        nodes.bitmaps.booting.clear(idx);
                        nodes.bitmaps.power_up.clear(idx);
                        resume_failed.set(idx);
                        touched.set(idx);
                        metrics::POWER_RESUME_TIMEOUTS_TOTAL.inc();
                    }
                }
            }

            if !resume_failed.is_empty() {
                warn!(
                    "{} node(s) failed to resume within {:?}",
                    resume_failed.count(),
                    ps.resume_timeout
                );
                if let Some(prog) = &ps.resume_fail_program {
                    scripts.push(ScriptSpec {
                        kind: ScriptKind::ResumeFail,
                        program: PathBuf::from(prog),
                        nodelist: nodes.expr_from_bitmap(&resume_failed),
                        env: Vec::new(),
                        timeout: max_script_timeout(ps),
                    });
                }
            }

            metrics::NODES_POWERED_DOWN.set(nodes.bitmaps.power_down.count() as f64);
            UpdateStamps::bump(&self.state.stamps.last_node_update);
            PassOutcome { scripts }
        };

        for spec in outcome.scripts {
            self.runner.spawn(spec);
        }
    }

    /// Collects the per-job fields the resume document needs. Runs before
    /// the node rail is taken (the job rail orders below it); the allocation
    /// bitmap is rendered to a hostlist once the node table is held.
    #[allow(clippy::type_complexity)]
    fn job_context(
        &self,
        requests: &[ResumeRequest],
    ) -> std::collections::HashMap<u32, (Option<NodeBitmap>, String, String, Option<String>)> {
        let mut out = std::collections::HashMap::new();
        if requests.is_empty() {
            return out;
        }
        let jobs = self.state.jobs.read();
        for req in requests {
            if let Some(job) = jobs.find(req.job_id) {
                let oversubscribe = match job.details.share_res {
                    Some(true) => "yes".to_string(),
                    _ => "no".to_string(),
                };
                out.insert(
                    req.job_id,
                    (
                        job.node_bitmap.clone(),
                        job.partition.clone().unwrap_or_default(),
                        oversubscribe,
                        job.details.reservation.clone(),
                    ),
                );
            }
        }
        out
    }

    fn reconcile_script(&self, completion: ScriptCompletion) {
        if completion.success {
            debug!(
                "{:?} script for '{}' succeeded",
                completion.kind, completion.nodelist
            );
            return;
        }
        warn!(
            "{:?} script for '{}' failed; nodes will be reconciled by timeout",
            completion.kind, completion.nodelist
        );
    }
}

fn max_script_timeout(ps: &PowerSaveConfig) -> Duration {
    ps.suspend_timeout.max(ps.resume_timeout)
}

fn unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Builds the set of nodes suspension must not touch: excluded partitions
/// plus excluded node groups. A `group:N` entry keeps only N nodes of the
/// group awake; currently-active nodes consume that quota before suspendable
/// ones do.
fn build_avoid_bitmap(
    nodes: &crate::core::state::tables::NodeTable,
    ps: &PowerSaveConfig,
    now: i64,
) -> NodeBitmap {
    let len = nodes.len();
    let mut avoid = NodeBitmap::new(len);

    if let Some(expr) = &ps.suspend_exc_nodes {
        for group in split_exc_groups(expr) {
            let (names_expr, quota) = match split_group_count(&group) {
                Some((expr, n)) => (expr, Some(n)),
                None => (group.as_str(), None),
            };
            let Ok(names) = hostlist::expand(names_expr) else {
                warn!("Bad suspend_exc_nodes entry '{group}'");
                continue;
            };
            let indices: Vec<usize> = names
                .iter()
                .filter_map(|n| nodes.index_of(n).map(|i| i as usize))
                .collect();
            match quota {
                None => {
                    for idx in indices {
                        avoid.set(idx);
                    }
                }
                Some(mut quota) => {
                    // Awake nodes only; already-suspended members would
                    // waste the quota. Active nodes consume it before
                    // suspendable ones.
                    let awake: Vec<usize> = indices
                        .into_iter()
                        .filter(|idx| {
                            nodes
                                .get(*idx as u32)
                                .map(|n| {
                                    !n.state.is_powered_down() && !n.state.is_powering_down()
                                })
                                .unwrap_or(false)
                        })
                        .collect();
                    let is_suspendable = |idx: &usize| {
                        nodes
                            .get(*idx as u32)
                            .map(|n| {
                                n.state.is_idle()
                                    && now - n.last_busy > ps.suspend_time.as_secs() as i64
                            })
                            .unwrap_or(false)
                    };
                    let (suspendable, active): (Vec<usize>, Vec<usize>) =
                        awake.into_iter().partition(|i| is_suspendable(i));
                    for idx in active.into_iter().chain(suspendable) {
                        if quota == 0 {
                            break;
                        }
                        avoid.set(idx);
                        quota -= 1;
                    }
                }
            }
        }
    }

    avoid
}

/// Splits the exclusion expression on commas outside brackets, so
/// `a[1-3]:2,b1` yields two groups.
fn split_exc_groups(expr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0;
    let mut cur = String::new();
    for c in expr.chars() {
        match c {
            '[' => {
                depth += 1;
                cur.push(c);
            }
            ']' => {
                depth -= 1;
                cur.push(c);
            }
            ',' if depth == 0 => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Splits a trailing `:N` count off a group, if present after the brackets.
fn split_group_count(group: &str) -> Option<(&str, u32)> {
    let colon = group.rfind(':')?;
    if group[colon..].contains(']') {
        return None;
    }
    let count: u32 = group[colon + 1..].parse().ok()?;
    Some((&group[..colon], count))
}
