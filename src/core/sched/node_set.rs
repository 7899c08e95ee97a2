// src/core/sched/node_set.rs

//! Node-set construction: turning the configuration records into an ordered
//! array of homogeneous scheduling buckets for one job.

use super::features::FeatureExpr;
use crate::core::state::tables::NodeTable;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::Job;
use crate::core::types::partition::Partition;
use crate::core::types::reservation::{Reservation, ResvFlags};
use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeSetFlags: u8 {
        /// Members must reboot to activate a requested feature.
        const REBOOT       = 1 << 0;
        /// Members sit outside a flexible reservation the job may draw from.
        const OUTSIDE_FLEX = 1 << 1;
        /// Members are powered down and need a resume first.
        const POWER_DN     = 1 << 2;
    }
}

/// A scheduling bucket: nodes with identical capacity, weight and feature
/// signature. The selection loop consumes these in `sched_weight` order.
#[derive(Clone, Debug)]
pub struct NodeSet {
    pub cpus_per_node: u16,
    pub real_memory: u64,
    pub weight: u32,
    /// Bitmask over the job's exclusive feature alternatives.
    pub feature_bits: u64,
    pub node_bitmap: NodeBitmap,
    pub flags: NodeSetFlags,
    pub sched_weight: u64,
}

/// Encodes the priority class of a set. Bit 41 penalizes reboot-requiring
/// sets, bit 40 penalizes leaving a flex reservation, bits 8-39 carry the
/// configured weight, and the low byte is reserved for plugin tiebreaks.
pub fn sched_weight(weight: u32, flags: NodeSetFlags) -> u64 {
    let mut w = ((weight as u64) << 8) | 0xff;
    if flags.contains(NodeSetFlags::REBOOT) {
        w |= 1 << 41;
    }
    if flags.contains(NodeSetFlags::OUTSIDE_FLEX) {
        w |= 1 << 40;
    }
    w
}

/// Inputs that vary per pass but not per configuration record.
pub struct NodeSetContext<'a> {
    pub nodes: &'a NodeTable,
    pub partition: &'a Partition,
    /// Nodes usable after reservation/ownership filtering.
    pub usable: &'a NodeBitmap,
    /// Flexible reservations the job participates in.
    pub flex_resvs: Vec<&'a Reservation>,
    /// Nodes whose owner hit a TRES-node limit; they get a weight penalty.
    pub tres_limited: Option<&'a NodeBitmap>,
}

/// Builds the node-set array for a job. Sets are homogeneous in capacity,
/// weight, feature signature and flag class, and come back stably sorted by
/// ascending `sched_weight`.
pub fn build_node_sets(
    job: &Job,
    expr: Option<&FeatureExpr>,
    ctx: &NodeSetContext<'_>,
) -> Vec<NodeSet> {
    let mut sets: Vec<NodeSet> = Vec::new();
    let details = &job.details;

    for record in &ctx.nodes.config_records {
        // Candidate membership: config nodes inside the partition and the
        // usable set, minus the job's excluded nodes.
        let mut candidate = record.node_bitmap.clone();
        candidate.intersect_with(&ctx.partition.node_bitmap);
        candidate.intersect_with(ctx.usable);
        if let Some(exc) = &details.exc_node_bitmap {
            candidate.difference_with(exc);
        }
        if candidate.is_empty() {
            continue;
        }

        // Per-node capacity minimums.
        let cpus_needed = details.cpus_per_task.max(1);
        for idx in candidate.clone().iter_ones() {
            let Some(node) = ctx.nodes.get(idx as u32) else {
                candidate.clear(idx);
                continue;
            };
            if node.cpus < cpus_needed
                || node.real_memory < details.pn_min_memory
                || node.tmp_disk < details.pn_min_tmp_disk
            {
                candidate.clear(idx);
            }
        }
        if candidate.is_empty() {
            continue;
        }

        // Feature filtering and the exclusive-alternative signature.
        let mut groups: Vec<(u64, NodeBitmap)> = Vec::new();
        match expr {
            Some(expr) if expr.has_exclusive() => {
                for idx in candidate.iter_ones() {
                    let Some(node) = ctx.nodes.get(idx as u32) else {
                        continue;
                    };
                    if !expr.eval(node).1 {
                        continue;
                    }
                    let mask = expr.alternative_mask(node);
                    if mask == 0 {
                        continue;
                    }
                    match groups.iter_mut().find(|(m, _)| *m == mask) {
                        Some((_, bm)) => bm.set(idx),
                        None => {
                            let mut bm = NodeBitmap::new(ctx.nodes.len());
                            bm.set(idx);
                            groups.push((mask, bm));
                        }
                    }
                }
            }
            Some(expr) => {
                let mut bm = NodeBitmap::new(ctx.nodes.len());
                for idx in candidate.iter_ones() {
                    if let Some(node) = ctx.nodes.get(idx as u32) {
                        if expr.eval(node).1 {
                            bm.set(idx);
                        }
                    }
                }
                if !bm.is_empty() {
                    groups.push((1, bm));
                }
            }
            None => groups.push((1, candidate)),
        }

        for (feature_bits, bitmap) in groups {
            split_and_push(job, expr, ctx, record.cpus, record.real_memory, record.weight,
                feature_bits, bitmap, &mut sets);
        }
    }

    // Stable ascending sort: equal sched_weight keeps input order.
    sets.sort_by_key(|s| s.sched_weight);
    sets
}

/// Splits one homogeneous group along the reboot, flex-reservation, powered-
/// down and TRES-limit boundaries, then pushes the resulting sets.
#[allow(clippy::too_many_arguments)]
fn split_and_push(
    job: &Job,
    expr: Option<&FeatureExpr>,
    ctx: &NodeSetContext<'_>,
    cpus_per_node: u16,
    real_memory: u64,
    weight: u32,
    feature_bits: u64,
    bitmap: NodeBitmap,
    sets: &mut Vec<NodeSet>,
) {
    // Reboot boundary: nodes that satisfy the expression with active
    // features now, versus only after realizing a changeable feature.
    let mut no_reboot = bitmap.clone();
    let mut needs_reboot = NodeBitmap::new(bitmap.len());
    if let Some(expr) = expr {
        for idx in bitmap.iter_ones() {
            if let Some(node) = ctx.nodes.get(idx as u32) {
                if !expr.eval(node).0 {
                    no_reboot.clear(idx);
                    needs_reboot.set(idx);
                }
            }
        }
    }
    if job.details.reboot {
        // An explicit reboot request puts every member in the reboot class.
        needs_reboot.union_with(&no_reboot);
        no_reboot.clear_all();
    }

    for (part_bitmap, flags) in [
        (no_reboot, NodeSetFlags::empty()),
        (needs_reboot, NodeSetFlags::REBOOT),
    ] {
        if part_bitmap.is_empty() {
            continue;
        }

        // Flex boundary: members inside any of the job's flex reservations
        // keep the base class; outsiders carry a penalty bit.
        let mut inside = part_bitmap.clone();
        let mut outside = NodeBitmap::new(part_bitmap.len());
        if !ctx.flex_resvs.is_empty() {
            let mut flex_all = NodeBitmap::new(part_bitmap.len());
            for resv in &ctx.flex_resvs {
                if resv.flags.contains(ResvFlags::FLEX) {
                    flex_all.union_with(&resv.node_bitmap);
                }
            }
            outside = part_bitmap.clone();
            outside.difference_with(&flex_all);
            inside.intersect_with(&flex_all);
        }

        for (sub_bitmap, outside_flex) in [(inside, false), (outside, true)] {
            if sub_bitmap.is_empty() {
                continue;
            }
            let mut sub_flags = flags;
            if outside_flex && !ctx.flex_resvs.is_empty() {
                sub_flags |= NodeSetFlags::OUTSIDE_FLEX;
            }

            // Powered-down members go into their own class.
            let mut awake = sub_bitmap.clone();
            let mut asleep = sub_bitmap.clone();
            awake.difference_with(&ctx.nodes.bitmaps.power_down);
            asleep.intersect_with(&ctx.nodes.bitmaps.power_down);

            for (final_bitmap, power_dn) in [(awake, false), (asleep, true)] {
                if final_bitmap.is_empty() {
                    continue;
                }
                let mut final_flags = sub_flags;
                if power_dn {
                    final_flags |= NodeSetFlags::POWER_DN;
                }

                // TRES-node-limit penalty: affected members weigh one more.
                let (limited, free) = match ctx.tres_limited {
                    Some(limited_bm) => {
                        let mut lim = final_bitmap.clone();
                        lim.intersect_with(limited_bm);
                        let mut free = final_bitmap.clone();
                        free.difference_with(limited_bm);
                        (lim, free)
                    }
                    None => (NodeBitmap::new(final_bitmap.len()), final_bitmap),
                };

                for (bm, w) in [(free, weight), (limited, weight.saturating_add(1))] {
                    if bm.is_empty() {
                        continue;
                    }
                    sets.push(NodeSet {
                        cpus_per_node,
                        real_memory,
                        weight: w,
                        feature_bits,
                        node_bitmap: bm,
                        flags: final_flags,
                        sched_weight: sched_weight(w, final_flags),
                    });
                }
            }
        }
    }
}
