// src/core/sched/allocate.rs

//! Committing a selection: node state transitions, counters, licenses,
//! reserved ports, prolog dispatch. And the inverse on job completion.

use crate::core::agent::DbdRpcType;
use crate::core::errors::LodestarError;
use crate::core::metrics;
use crate::core::power::ResumeRequest;
use crate::core::state::SharedState;
use crate::core::state::tables::UpdateStamps;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::{Job, JobFlags, JobState};
use crate::core::types::node::{BaseState, NodeFlags};
use tracing::{debug, info, warn};

/// Prolog dispatch seam. The real implementation forwards to the node
/// daemons; the noop variant is used when no prolog is configured.
pub trait PrologDispatch: Send + Sync {
    fn launch_prolog(&self, job: &Job);
}

pub struct NoopProlog;

impl PrologDispatch for NoopProlog {
    fn launch_prolog(&self, _job: &Job) {}
}

/// Reserved-port allocation seam for MPI jobs. The count calculation is
/// ours; handing out concrete ranges belongs to the step-management layer.
pub trait PortReserver: Send + Sync {
    fn reserve(&self, job_id: u32, ports_per_node: u16, node_count: u32) -> Option<String>;
}

pub struct NoopPortReserver;

impl PortReserver for NoopPortReserver {
    fn reserve(&self, _job_id: u32, _ports_per_node: u16, _node_count: u32) -> Option<String> {
        None
    }
}

/// Ports to reserve per node. The branch structure and its implicit
/// round-up are load-bearing for existing workloads; do not rearrange.
pub fn reserved_port_count(job: &Job, alloc_node_cnt: u32, max_cpus_per_node: u16) -> u16 {
    let d = &job.details;
    if let Some(n) = d.ntasks_per_node {
        return n;
    }
    if let Some(n) = d.ntasks_per_tres {
        return n;
    }
    if let Some(tasks) = d.num_tasks {
        let nodes = alloc_node_cnt.max(1);
        return ((tasks + nodes - 1) / nodes) as u16;
    }
    if d.whole_node != crate::core::types::job::WholeNode::NotSet {
        return max_cpus_per_node;
    }
    1
}

/// Atomically commits an allocation. Requires that `selected` passed
/// feasibility; holds job-write then node-write then part-write, in rail
/// order, and the license mutex after all rails.
pub fn allocate_nodes(
    state: &SharedState,
    job_id: u32,
    selected: &NodeBitmap,
    partition: &str,
    prolog: &dyn PrologDispatch,
    ports: &dyn PortReserver,
) -> Result<(), LodestarError> {
    let now = chrono::Utc::now().timestamp();
    let mut resume_requests: Vec<ResumeRequest> = Vec::new();

    let mut jobs = state.jobs.write();
    let job = jobs
        .find_mut(job_id)
        .ok_or(LodestarError::JobNotFound(job_id))?;

    let mut max_cpus_per_node: u16 = 0;
    {
        let mut nodes = state.nodes.write();
        let mut wake_bitmap = NodeBitmap::new(nodes.len());
        let mut needs_boot = false;

        for idx in selected.iter_ones() {
            let Some(node) = nodes.get_mut(idx as u32) else {
                return Err(LodestarError::Internal(format!(
                    "selected node index {idx} is out of range"
                )));
            };
            // Base state changes preserve the sticky flag bits.
            node.state.transition(BaseState::Alloc)?;
            node.run_jobs += 1;
            max_cpus_per_node = max_cpus_per_node.max(node.cpus);

            if node.state.is_powered_down() {
                node.state.set_flag(NodeFlags::POWER_UP);
                node.boot_req_time = Some(now);
                needs_boot = true;
                wake_bitmap.set(idx);
            }

            // Arm a reboot when the job needs a feature the node can only
            // realize by rebooting into it.
            if let Some(expr_str) = &job.details.features {
                if let Ok(expr) = super::features::FeatureExpr::parse(expr_str) {
                    let (active, avail) = expr.eval(node);
                    if !active && avail {
                        node.state.set_flag(NodeFlags::REBOOT_REQUESTED);
                        node.boot_req_time = Some(now);
                        needs_boot = true;
                    }
                }
            }
        }

        if needs_boot {
            job.flags.insert(JobFlags::POWER_UP_NODE);
        }
        if !wake_bitmap.is_empty() {
            resume_requests.push(ResumeRequest {
                job_id,
                node_bitmap: wake_bitmap,
                features: job.details.features.clone(),
                extra: None,
            });
        }

        // Allocated nodes leave the idle and available pools; shareable
        // allocations join the share pool instead.
        nodes.bitmaps.idle.difference_with(selected);
        nodes.bitmaps.avail.difference_with(selected);
        if job.details.share_res.unwrap_or(false) {
            nodes.bitmaps.share.union_with(selected);
        }

        // Alias list for cloud and dynamic nodes, used by the launch path.
        let mut aliases: Vec<String> = Vec::new();
        for idx in selected.iter_ones() {
            if let Some(node) = nodes.get(idx as u32) {
                if node.state.flags.intersects(
                    NodeFlags::CLOUD | NodeFlags::DYNAMIC_NORM | NodeFlags::DYNAMIC_FUTURE,
                ) {
                    let addr = node.comm_addr.clone().unwrap_or_else(|| node.name.clone());
                    aliases.push(format!("{}:{}", node.name, addr));
                }
            }
        }
        if !aliases.is_empty() {
            job.alias_list = Some(aliases.join(","));
        }

        UpdateStamps::bump(&state.stamps.last_node_update);
    }

    {
        let mut parts = state.parts.write();
        if let Some(part) = parts.find_mut(partition) {
            part.job_count += 1;
        } else {
            warn!("job {job_id}: allocated partition '{partition}' not found");
        }
        UpdateStamps::bump(&state.stamps.last_part_update);
    }

    {
        let mut ledger = state.licenses.lock();
        if let Err(e) = ledger.job_get(job, false) {
            // Partial effect is kept; the return path saturates.
            warn!("job {job_id}: license claim incomplete: {e}");
        }
        UpdateStamps::bump(&state.stamps.last_license_update);
    }

    // Reserved MPI ports, when the job opted in.
    if job.details.resv_port_cnt.is_some() {
        let per_node = match job.details.resv_port_cnt {
            Some(0) | None => reserved_port_count(job, selected.count() as u32, max_cpus_per_node),
            Some(n) => n,
        };
        job.resv_ports = ports.reserve(job_id, per_node, selected.count() as u32);
        if job.resv_ports.is_some() {
            job.flags.insert(JobFlags::STEPMGR_ENABLED);
        }
    }

    job.state = JobState::Running;
    job.state_reason = crate::core::types::job::StateReason::None;
    job.state_desc = None;
    job.start_time = Some(now);
    job.node_bitmap = Some(selected.clone());
    job.partition = Some(partition.to_string());
    UpdateStamps::bump(&state.stamps.last_job_update);

    prolog.launch_prolog(job);

    if let Err(e) = state.agent.send(DbdRpcType::JobStart, job_start_record(job)) {
        warn!("job {job_id}: could not queue accounting start record: {e}");
    }

    metrics::SCHED_ALLOCATIONS_TOTAL.inc();
    info!(
        "Allocated job {job_id}: {} nodes in partition '{partition}'",
        selected.count()
    );

    for req in resume_requests {
        state.resume_job_list.lock().push(req);
        state.power_kick.notify_one();
    }

    Ok(())
}

/// Returns a job's resources: the inverse of `allocate_nodes`. Nodes with no
/// remaining work go back to IDLE and rejoin the idle/available pools.
pub fn deallocate_nodes(state: &SharedState, job_id: u32) -> Result<(), LodestarError> {
    let now = chrono::Utc::now().timestamp();

    let mut jobs = state.jobs.write();
    let job = jobs
        .find_mut(job_id)
        .ok_or(LodestarError::JobNotFound(job_id))?;
    let Some(selected) = job.node_bitmap.clone() else {
        debug!("job {job_id}: deallocate with no allocation");
        return Ok(());
    };

    {
        let mut nodes = state.nodes.write();
        for idx in selected.iter_ones() {
            let Some(node) = nodes.get_mut(idx as u32) else {
                continue;
            };
            node.run_jobs = node.run_jobs.saturating_sub(1);
            node.last_busy = now;
            if node.run_jobs == 0 {
                node.state.transition(BaseState::Idle)?;
                node.state.clear_flag(NodeFlags::COMPLETING);
                nodes.bitmaps.idle.set(idx);
                nodes.bitmaps.avail.set(idx);
                nodes.bitmaps.share.clear(idx);
                nodes.bitmaps.cg.clear(idx);
            }
        }
        UpdateStamps::bump(&state.stamps.last_node_update);
    }

    {
        let mut parts = state.parts.write();
        if let Some(name) = &job.partition {
            if let Some(part) = parts.find_mut(name) {
                part.job_count = part.job_count.saturating_sub(1);
            }
        }
        UpdateStamps::bump(&state.stamps.last_part_update);
    }

    {
        let mut ledger = state.licenses.lock();
        ledger.job_return(job);
        UpdateStamps::bump(&state.stamps.last_license_update);
    }

    job.state = JobState::Complete;
    job.end_time = Some(now);
    job.node_bitmap = None;
    UpdateStamps::bump(&state.stamps.last_job_update);

    if let Err(e) = state.agent.send(DbdRpcType::JobComplete, job_complete_record(job)) {
        warn!("job {job_id}: could not queue accounting completion record: {e}");
    }

    Ok(())
}

fn job_start_record(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id,
        "user_id": job.user_id,
        "partition": job.partition,
        "start_time": job.start_time,
        "node_count": job.node_bitmap.as_ref().map_or(0, |bm| bm.count()),
    })
}

fn job_complete_record(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id,
        "state": "complete",
        "end_time": job.end_time,
    })
}
