// src/core/sched/select.rs

//! The selection loop: walk the weighted node sets and find a feasible
//! subset for the job.
//!
//! Sets are consumed in ascending `sched_weight` order, accumulating nodes
//! until the request could fit, then the select backend is asked to commit.
//! Preemption candidates are only offered at the widest accumulation so the
//! scheduler never preempts to reach lower-weight nodes when higher-weight
//! nodes would do.

use super::features::FeatureExpr;
use super::node_set::NodeSet;
use super::share::ShareDecision;
use crate::core::errors::LodestarError;
use crate::core::license::LicenseTest;
use crate::core::state::tables::NodeTable;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::Job;

/// Selection failures, ordered by specificity. The loop reports the most
/// specific failure it saw across all attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectError {
    /// Least specific: the request collides with an advance reservation.
    ReservationBusy,
    /// Nodes exist but are running other work.
    NodesBusy,
    /// Required nodes are down, draining or unusable.
    NodeNotAvail,
    /// The request exceeds what this partition's hardware can ever provide.
    NeverRunnable,
    /// Most specific: licenses are the limiting resource.
    LicensesUnavailable,
}

impl From<SelectError> for LodestarError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::ReservationBusy => LodestarError::ReservationBusy,
            SelectError::NodesBusy => LodestarError::NodesBusy,
            SelectError::NodeNotAvail => LodestarError::NodeNotAvail,
            SelectError::NeverRunnable => LodestarError::RequestedNodeConfigUnavailable,
            SelectError::LicensesUnavailable => LodestarError::LicensesUnavailable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Commit resources on success.
    Run,
    /// Feasibility probe only (will-run tests, backfill).
    Test,
}

/// The select backend seam. The default backends are first-fit; the trait
/// exists so richer placement logic slots in without touching the loop.
pub trait SelectPlugin: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn job_test(
        &self,
        job: &Job,
        avail: &NodeBitmap,
        nodes: &NodeTable,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
        mode: SelectMode,
        share: ShareDecision,
    ) -> Result<NodeBitmap, SelectError>;
}

/// First-fit node picker used by both configured backends: required nodes
/// first, then ascending index order (the caller's accumulation already
/// encodes weight order in which nodes are present at all).
pub struct FirstFitSelect;

impl SelectPlugin for FirstFitSelect {
    fn job_test(
        &self,
        job: &Job,
        avail: &NodeBitmap,
        nodes: &NodeTable,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
        _mode: SelectMode,
        _share: ShareDecision,
    ) -> Result<NodeBitmap, SelectError> {
        let mut chosen = NodeBitmap::new(avail.len());

        if let Some(required) = &job.details.req_node_bitmap {
            if !required.is_subset_of(avail) {
                return Err(SelectError::NodeNotAvail);
            }
            chosen.union_with(required);
        }

        let want_nodes = req_nodes.max(min_nodes).max(1);
        let mut cpus = 0u32;
        for idx in chosen.iter_ones() {
            cpus += nodes.get(idx as u32).map_or(0, |n| n.cpus as u32);
        }

        for idx in avail.iter_ones() {
            if chosen.count() as u32 >= want_nodes && cpus >= job.details.min_cpus {
                break;
            }
            if chosen.test(idx) {
                continue;
            }
            if chosen.count() as u32 >= max_nodes.max(want_nodes) {
                break;
            }
            chosen.set(idx);
            cpus += nodes.get(idx as u32).map_or(0, |n| n.cpus as u32);
        }

        if (chosen.count() as u32) < want_nodes || cpus < job.details.min_cpus {
            return Err(SelectError::NodesBusy);
        }
        Ok(chosen)
    }
}

/// Everything `pick_best_nodes` needs besides the job itself.
pub struct PickInputs<'a> {
    pub nodes: &'a NodeTable,
    pub sets: &'a [NodeSet],
    pub expr: Option<&'a FeatureExpr>,
    pub share: ShareDecision,
    /// Result of the ledger test for this job at this time.
    pub license_status: LicenseTest,
    /// Nodes occupied by preemption candidates, offered at the last tier.
    pub preemptable: Option<&'a NodeBitmap>,
    pub mode: SelectMode,
}

/// Picks nodes for the job, or reports the most specific reason it cannot.
pub fn pick_best_nodes(
    job: &Job,
    inputs: &PickInputs<'_>,
    plugin: &dyn SelectPlugin,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<NodeBitmap, SelectError> {
    let licenses_short = match inputs.license_status {
        LicenseTest::Ok => false,
        LicenseTest::Again => true,
        LicenseTest::Never => return Err(SelectError::LicensesUnavailable),
    };

    let pickable_base = pickable_base(inputs);

    // Counted exclusive alternatives whose counts must combine (XAND, or MOR
    // counts that only sum to the request) take a dedicated path.
    if let Some(expr) = inputs.expr {
        if expr.has_exclusive() {
            let alternatives = expr.alternatives();
            let sum: u32 = alternatives.iter().filter_map(|a| a.count).sum();
            let single_fits = alternatives
                .iter()
                .any(|a| a.count.unwrap_or(0) >= req_nodes.max(1));
            if expr.has_xand() || (!single_fits && sum >= req_nodes.max(1)) {
                let result =
                    pick_counted_alternatives(job, inputs, &pickable_base, min_nodes, max_nodes);
                return finish(result, licenses_short);
            }
        }
    }

    let alternative_count = inputs
        .expr
        .filter(|e| e.has_exclusive())
        .map(|e| e.alternatives().len())
        .unwrap_or(1);

    let mut best_err = SelectError::ReservationBusy;
    let mut runnable_ever = false;

    for alt in 0..alternative_count {
        let bit = 1u64 << alt;
        let candidates: Vec<&NodeSet> = inputs
            .sets
            .iter()
            .filter(|s| alternative_count == 1 || s.feature_bits & bit != 0)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let mut total = NodeBitmap::new(inputs.nodes.len());
        for set in &candidates {
            total.union_with(&set.node_bitmap);
        }
        if total.count() as u32 >= min_nodes.max(1) {
            runnable_ever = true;
        }

        let mut accum = match &job.details.req_node_bitmap {
            Some(req) => req.clone(),
            None => NodeBitmap::new(inputs.nodes.len()),
        };

        let last = candidates.len() - 1;
        for (i, set) in candidates.iter().enumerate() {
            let mut pickable = set.node_bitmap.clone();
            pickable.intersect_with(&pickable_base);
            accum.union_with(&pickable);

            let is_last = i == last;
            if is_last {
                if let Some(preemptable) = inputs.preemptable {
                    // Widest tier only: allow displacing running work.
                    accum.union_with(preemptable);
                }
            }

            let enough = accum.count() as u32 >= req_nodes.max(min_nodes).max(1)
                || accum.count() as u32 >= max_nodes;
            if !enough && !is_last {
                continue;
            }

            match plugin.job_test(
                job,
                &accum,
                inputs.nodes,
                min_nodes,
                max_nodes,
                req_nodes,
                inputs.mode,
                inputs.share,
            ) {
                Ok(bm) => return finish(Ok(bm), licenses_short),
                Err(e) => best_err = best_err.max(e),
            }
        }
    }

    if !runnable_ever {
        best_err = best_err.max(SelectError::NeverRunnable);
    }
    finish(Err(best_err), licenses_short)
}

/// The nodes the loop may hand to the backend: idle (or shareable) members
/// of the available set, excluding completing nodes, nodes waiting on an
/// asap reboot, and powered-down cloud nodes.
fn pickable_base(inputs: &PickInputs<'_>) -> NodeBitmap {
    let bitmaps = &inputs.nodes.bitmaps;
    let mut base = if inputs.share.can_share {
        bitmaps.share.union(&bitmaps.idle)
    } else {
        bitmaps.idle.clone()
    };
    base.intersect_with(&bitmaps.avail);
    base.difference_with(&bitmaps.cg);
    base.difference_with(&bitmaps.asap_reboot);
    let mut cloud_asleep = bitmaps.cloud.clone();
    cloud_asleep.intersect_with(&bitmaps.power_down);
    base.difference_with(&cloud_asleep);
    base
}

/// The combination path: every counted alternative must be satisfied by
/// exactly its count of distinct nodes, drawn from sets carrying that
/// alternative's bit in ascending weight order.
fn pick_counted_alternatives(
    job: &Job,
    inputs: &PickInputs<'_>,
    pickable_base: &NodeBitmap,
    min_nodes: u32,
    max_nodes: u32,
) -> Result<NodeBitmap, SelectError> {
    let expr = inputs.expr.expect("counted path requires an expression");
    let mut chosen = NodeBitmap::new(inputs.nodes.len());

    for (alt, atom) in expr.alternatives().iter().enumerate() {
        let bit = 1u64 << alt;
        let mut needed = atom.count.unwrap_or(0);
        if needed == 0 {
            continue;
        }
        for set in inputs.sets.iter().filter(|s| s.feature_bits & bit != 0) {
            let mut pickable = set.node_bitmap.clone();
            pickable.intersect_with(pickable_base);
            for idx in pickable.iter_ones() {
                if needed == 0 {
                    break;
                }
                if chosen.test(idx) {
                    continue;
                }
                chosen.set(idx);
                needed -= 1;
            }
            if needed == 0 {
                break;
            }
        }
        if needed > 0 {
            // Distinguish "can never" from "not now": does the full set
            // membership even contain enough nodes for this alternative?
            let mut capacity = 0u32;
            for set in inputs.sets.iter().filter(|s| s.feature_bits & bit != 0) {
                capacity += set.node_bitmap.count() as u32;
            }
            return Err(if capacity < atom.count.unwrap_or(0) {
                SelectError::NeverRunnable
            } else {
                SelectError::NodesBusy
            });
        }
    }

    let count = chosen.count() as u32;
    if count < min_nodes || (max_nodes > 0 && count > max_nodes) {
        return Err(SelectError::NeverRunnable);
    }
    if let Some(required) = &job.details.req_node_bitmap {
        if !required.is_subset_of(&chosen) {
            return Err(SelectError::NodeNotAvail);
        }
    }
    Ok(chosen)
}

/// License shortfalls outrank every other failure; a success stands on its
/// own only when the ledger said yes.
fn finish(
    result: Result<NodeBitmap, SelectError>,
    licenses_short: bool,
) -> Result<NodeBitmap, SelectError> {
    if licenses_short {
        return Err(SelectError::LicensesUnavailable);
    }
    result
}
