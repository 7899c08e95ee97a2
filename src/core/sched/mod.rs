// src/core/sched/mod.rs

//! The node selector: given a pending job, choose a feasible set of nodes.
//!
//! `select_nodes_for_job` is the entry point. It walks the job's candidate
//! partitions, builds weighted node sets for each, and asks the selection
//! loop for a placement. Every early return restores the job's request
//! fields so the next partition (or the next pass) sees the original
//! request, and failures land on the job as a pending reason.

pub mod allocate;
pub mod features;
pub mod filter;
pub mod node_set;
pub mod select;
pub mod share;

use crate::config::SelectBackend;
use crate::core::errors::LodestarError;
use crate::core::state::SharedState;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::{Job, JobState, StateReason};
use allocate::{NoopPortReserver, NoopProlog, PortReserver, PrologDispatch};
use features::FeatureExpr;
use select::{FirstFitSelect, PickInputs, SelectError, SelectMode, SelectPlugin};
use tracing::debug;

/// Outcome of one selection attempt.
#[derive(Debug)]
pub struct Selection {
    pub node_bitmap: NodeBitmap,
    pub partition: String,
}

/// Selects nodes for a pending job and, unless `test_only`, commits the
/// allocation. On failure the job's pending reason is updated and the most
/// specific error across candidate partitions is returned.
pub fn select_nodes_for_job(
    state: &SharedState,
    job_id: u32,
    test_only: bool,
    backend: SelectBackend,
    preempt_for_licenses: bool,
) -> Result<Selection, LodestarError> {
    let selection = probe_partitions(state, job_id, test_only, backend, preempt_for_licenses);

    match selection {
        Ok(sel) if !test_only => {
            allocate::allocate_nodes(
                state,
                job_id,
                &sel.node_bitmap,
                &sel.partition,
                &NoopProlog,
                &NoopPortReserver,
            )?;
            Ok(sel)
        }
        other => other,
    }
}

/// Variant with explicit collaborator implementations, used by the RPC
/// layer when a prolog or port reserver is configured.
pub fn select_and_allocate(
    state: &SharedState,
    job_id: u32,
    backend: SelectBackend,
    preempt_for_licenses: bool,
    prolog: &dyn PrologDispatch,
    ports: &dyn PortReserver,
) -> Result<Selection, LodestarError> {
    let sel = probe_partitions(state, job_id, false, backend, preempt_for_licenses)?;
    allocate::allocate_nodes(state, job_id, &sel.node_bitmap, &sel.partition, prolog, ports)?;
    Ok(sel)
}

fn probe_partitions(
    state: &SharedState,
    job_id: u32,
    test_only: bool,
    backend: SelectBackend,
    preempt_for_licenses: bool,
) -> Result<Selection, LodestarError> {
    // Probe against a private copy; the job table is only touched to record
    // the outcome. This keeps the no-partial-mutation contract for free.
    let mut job = {
        let jobs = state.jobs.read();
        let job = jobs.find(job_id).ok_or(LodestarError::JobNotFound(job_id))?;
        if job.state != JobState::Pending {
            return Err(LodestarError::InvalidRequest(format!(
                "job {job_id} is not pending"
            )));
        }
        job.clone()
    };

    let now = chrono::Utc::now().timestamp();

    let partitions: Vec<String> = if job.details.partitions.is_empty() {
        let parts = state.parts.read();
        match parts.default_partition() {
            Some(p) => vec![p.name.clone()],
            None => return Err(LodestarError::RequestedPartConfigUnavailable),
        }
    } else {
        job.details.partitions.clone()
    };

    let expr = match &job.details.features {
        Some(s) => Some(FeatureExpr::parse(s)?),
        None => None,
    };

    // The extra-constraints kludge: an unmatched opaque constraint leaves
    // the job pending rather than failing it, because matching attributes
    // may appear later. Preserved behavior, admittedly heuristic.
    if let Some(extra) = &job.details.extra_constraints {
        let nodes = state.nodes.read();
        let any_match = nodes.iter().any(|n| extra_constraints_match(extra, n));
        if !any_match {
            drop(nodes);
            record_failure(state, job_id, StateReason::Constraints, None);
            return Err(LodestarError::NodeNotAvail);
        }
    }

    let plugin = FirstFitSelect;
    let mut best_err: Option<SelectError> = None;
    let mut fatal: Option<(LodestarError, StateReason)> = None;

    for part_name in &partitions {
        let saved = job.save_select_fields();
        let result = probe_one_partition(
            state,
            &mut job,
            part_name,
            &expr,
            now,
            test_only,
            backend,
            preempt_for_licenses,
            &plugin,
        );
        match result {
            Ok(bitmap) => {
                if !test_only {
                    // Push collected preemption targets back to the table job.
                    let mut jobs = state.jobs.write();
                    if let Some(table_job) = jobs.find_mut(job_id) {
                        table_job.licenses_to_preempt = job.licenses_to_preempt.clone();
                    }
                }
                return Ok(Selection {
                    node_bitmap: bitmap,
                    partition: part_name.clone(),
                });
            }
            Err(ProbeError::Select(e)) => {
                job.restore_select_fields(saved);
                best_err = Some(best_err.map_or(e, |b| b.max(e)));
            }
            Err(ProbeError::Policy(err, reason)) => {
                job.restore_select_fields(saved);
                if fatal.is_none() {
                    fatal = Some((err, reason));
                }
            }
        }
    }

    if let Some(e) = best_err {
        record_failure(state, job_id, reason_for(e), None);
        return Err(e.into());
    }
    let (err, reason) = fatal.unwrap_or((
        LodestarError::RequestedPartConfigUnavailable,
        StateReason::PartNodeLimit,
    ));
    record_failure(state, job_id, reason, None);
    Err(err)
}

enum ProbeError {
    /// Selection-level failure; keep trying other partitions.
    Select(SelectError),
    /// Policy denial with its pending reason.
    Policy(LodestarError, StateReason),
}

#[allow(clippy::too_many_arguments)]
fn probe_one_partition(
    state: &SharedState,
    job: &mut Job,
    part_name: &str,
    expr: &Option<FeatureExpr>,
    now: i64,
    test_only: bool,
    backend: SelectBackend,
    preempt_for_licenses: bool,
    plugin: &dyn SelectPlugin,
) -> Result<NodeBitmap, ProbeError> {
    // License feasibility first: the most specific error outranks the rest,
    // and a never-satisfiable request should not scan nodes at all. The job
    // rail is rank-ordered below the others, so everything that needs it
    // happens before the node/part/resv reads.
    let (license_status, preempt_bitmap) = {
        let jobs_tbl = state.jobs.read();
        let resvs = state.resvs.read();
        let ledger = state.licenses.lock();
        // Captured by value so the ledger test can borrow the job mutably.
        let user_id = job.user_id;
        let account = job.account.clone();
        let resv_name = job.details.reservation.clone();
        let resv_share = |name: &str, when: i64, reboot: bool| -> u32 {
            resvs
                .iter()
                .filter(|r| !r.includes(user_id, account.as_deref(), resv_name.as_deref()))
                .map(|r| r.license_share(name, when, reboot))
                .sum()
        };
        let holders = |name: &str| -> Vec<u32> {
            jobs_tbl
                .iter_matching(|j| {
                    j.state == JobState::Running
                        && j.license_list.iter().any(|l| l.name == name)
                })
                .map(|j| j.id)
                .collect()
        };
        let reboot_needed = job.details.reboot;
        let status = ledger.job_test(
            job,
            now,
            reboot_needed,
            &resv_share,
            preempt_for_licenses,
            &holders,
        );

        let preempt_bitmap = if job.preemptee_job_ids.is_empty() {
            None
        } else {
            let mut bm: Option<NodeBitmap> = None;
            for id in &job.preemptee_job_ids {
                if let Some(victim) = jobs_tbl.find(*id) {
                    if let Some(victim_bm) = &victim.node_bitmap {
                        bm.get_or_insert_with(|| NodeBitmap::new(victim_bm.len()))
                            .union_with(victim_bm);
                    }
                }
            }
            bm
        };
        (status, preempt_bitmap)
    };

    let nodes = state.nodes.read();
    let parts = state.parts.read();
    let resvs = state.resvs.read();

    let part = parts.find(part_name).ok_or(ProbeError::Policy(
        LodestarError::InvalidPartitionName(part_name.to_string()),
        StateReason::PartNodeLimit,
    ))?;
    if !part.state_up {
        return Err(ProbeError::Policy(
            LodestarError::RequestedPartConfigUnavailable,
            StateReason::PartNodeLimit,
        ));
    }

    // Partition admission and size policy.
    if let Some(account) = &job.account {
        if !part.account_allowed(account) {
            return Err(ProbeError::Policy(
                LodestarError::InvalidAccount,
                StateReason::Account,
            ));
        }
    }
    if let Some(qos) = &job.details.qos {
        if !part.qos_allowed(qos) {
            return Err(ProbeError::Policy(
                LodestarError::InvalidQos,
                StateReason::Qos,
            ));
        }
    }
    let min_nodes = job.details.min_nodes.max(part.min_nodes).max(1);
    let max_nodes = job
        .details
        .max_nodes
        .or(part.max_nodes)
        .unwrap_or(part.total_nodes);
    if let Some(part_max) = part.max_nodes {
        if job.details.min_nodes > part_max {
            return Err(ProbeError::Policy(
                LodestarError::RequestedPartConfigUnavailable,
                StateReason::PartNodeLimit,
            ));
        }
    }
    if min_nodes > max_nodes || min_nodes > part.total_nodes {
        return Err(ProbeError::Policy(
            LodestarError::InvalidNodeCount,
            StateReason::PartNodeLimit,
        ));
    }
    if let (Some(limit), Some(part_limit)) = (job.details.time_limit, part.max_time) {
        if limit > part_limit {
            return Err(ProbeError::Policy(
                LodestarError::RequestedPartConfigUnavailable,
                StateReason::PartTimeLimit,
            ));
        }
    }
    // Partition-local clamps live on the probe copy only; the caller
    // restores the saved fields before trying the next partition.
    job.details.min_nodes = min_nodes;
    let share = share::resolve_share(job, part.share, backend);
    job.details.share_res = Some(share.can_share);

    // Usable nodes after ownership and reservation filtering.
    let mut usable = NodeBitmap::new_full(nodes.len());
    filter::filter_usable(job, part, &nodes, &resvs, now, &mut usable);

    let flex_resvs: Vec<&crate::core::types::reservation::Reservation> = resvs
        .iter()
        .filter(|r| {
            r.flags
                .contains(crate::core::types::reservation::ResvFlags::FLEX)
                && r.is_active_at(now)
                && r.includes_job(job)
        })
        .collect();

    let ctx = node_set::NodeSetContext {
        nodes: &nodes,
        partition: part,
        usable: &usable,
        flex_resvs,
        tres_limited: None,
    };
    let sets = node_set::build_node_sets(job, expr.as_ref(), &ctx);
    if sets.is_empty() {
        return Err(ProbeError::Select(SelectError::NeverRunnable));
    }

    let inputs = PickInputs {
        nodes: &nodes,
        sets: &sets,
        expr: expr.as_ref(),
        share,
        license_status: license_status.clone(),
        preemptable: preempt_bitmap.as_ref(),
        mode: if test_only {
            SelectMode::Test
        } else {
            SelectMode::Run
        },
    };

    let req_nodes = job.details.min_nodes;
    select::pick_best_nodes(job, &inputs, plugin, min_nodes, max_nodes, req_nodes)
        .map_err(ProbeError::Select)
}

fn reason_for(e: SelectError) -> StateReason {
    match e {
        SelectError::LicensesUnavailable => StateReason::Licenses,
        SelectError::NeverRunnable => StateReason::BadConstraints,
        SelectError::NodeNotAvail => StateReason::NodeNotAvail,
        SelectError::NodesBusy => StateReason::Resources,
        SelectError::ReservationBusy => StateReason::Reservation,
    }
}

fn record_failure(state: &SharedState, job_id: u32, reason: StateReason, desc: Option<String>) {
    let mut jobs = state.jobs.write();
    if let Some(job) = jobs.find_mut(job_id) {
        job.set_reason(reason, desc);
        debug!("job {job_id} stays pending: {:?}", job.state_reason);
    }
}

/// Matches a job's opaque constraint expression (`key=value[,key=value]`)
/// against a node's site-defined attributes.
pub fn extra_constraints_match(expr: &str, node: &crate::core::types::node::Node) -> bool {
    let Some(attrs) = node.extra.as_ref().and_then(|v| v.as_object()) else {
        return false;
    };
    expr.split(',').all(|pair| {
        let Some((key, value)) = pair.split_once('=') else {
            return false;
        };
        attrs
            .get(key.trim())
            .is_some_and(|v| v.as_str() == Some(value.trim()) || v.to_string() == value.trim())
    })
}
