// src/core/sched/filter.rs

//! Ownership filtering: nodes the job may not touch regardless of capacity.

use crate::core::state::tables::{NodeTable, ResvTable};
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::{Job, WholeNode};
use crate::core::types::partition::Partition;
use crate::core::types::reservation::ResvFlags;

/// Removes from `usable`:
/// (a) nodes exclusively owned by another user, when the job or partition
///     demands exclusive-user ownership;
/// (b) nodes whose MCS label differs from the job's;
/// (c) nodes inside any active advance reservation that does not admit the
///     job. Flex reservations stay usable (the weight penalty handles them).
pub fn filter_usable(
    job: &Job,
    partition: &Partition,
    nodes: &NodeTable,
    resvs: &ResvTable,
    now: i64,
    usable: &mut NodeBitmap,
) {
    let wants_exclusive_user =
        job.details.whole_node == WholeNode::User || partition.exclusive_user;

    for idx in usable.clone().iter_ones() {
        let Some(node) = nodes.get(idx as u32) else {
            usable.clear(idx);
            continue;
        };
        if wants_exclusive_user {
            if let Some(owner) = node.owner {
                if owner != job.user_id {
                    usable.clear(idx);
                    continue;
                }
            }
        }
        if let (Some(node_label), Some(job_label)) = (&node.mcs_label, &job.mcs_label) {
            if node_label != job_label {
                usable.clear(idx);
                continue;
            }
        }
    }

    for resv in resvs.iter() {
        if !resv.is_active_at(now) || resv.flags.contains(ResvFlags::FLEX) {
            continue;
        }
        if resv.includes_job(job) {
            continue;
        }
        usable.difference_with(&resv.node_bitmap);
    }
}
