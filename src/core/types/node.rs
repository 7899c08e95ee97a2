// src/core/types/node.rs

//! The node record: identity, capacity, and dynamic state.
//!
//! Dynamic state is a typed pair of one base state plus a flag bitset. All
//! base-state changes funnel through [`NodeState::transition`], which asserts
//! legality; flag updates go through setters that maintain the power-state
//! exclusion invariants.

use crate::core::errors::LodestarError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// The exclusive base states a node can be in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum BaseState {
    #[default]
    Unknown,
    Idle,
    Alloc,
    /// Partially allocated: some CPUs busy, some free.
    Mix,
    Down,
    Future,
}

bitflags! {
    /// State flags layered over the base state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub struct NodeFlags: u32 {
        const COMPLETING      = 1 << 0;
        const DRAIN           = 1 << 1;
        const FAIL            = 1 << 2;
        const MAINT           = 1 << 3;
        const NO_RESPOND      = 1 << 4;
        /// Boot requested and underway.
        const POWERING_UP     = 1 << 5;
        const POWERED_DOWN    = 1 << 6;
        /// Suspend script issued, shutdown in progress.
        const POWERING_DOWN   = 1 << 7;
        /// Power down requested for the next pass.
        const POWER_DOWN      = 1 << 8;
        /// Power down as soon as possible, ignoring the idle window.
        const POWER_DOWN_ASAP = 1 << 9;
        const POWER_UP        = 1 << 10;
        const REBOOT_REQUESTED = 1 << 11;
        const REBOOT_ISSUED   = 1 << 12;
        const CLOUD           = 1 << 13;
        const DYNAMIC_FUTURE  = 1 << 14;
        const DYNAMIC_NORM    = 1 << 15;
        /// Node is inside an advance reservation.
        const RES             = 1 << 16;
        /// Node is earmarked by the scheduler for a future job.
        const PLANNED         = 1 << 17;
        /// Registration did not match the configured hardware.
        const INVALID_REG     = 1 << 18;
    }
}

/// One base state plus its flag overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeState {
    pub base: BaseState,
    pub flags: NodeFlags,
}

impl NodeState {
    pub fn new(base: BaseState) -> Self {
        Self {
            base,
            flags: NodeFlags::empty(),
        }
    }

    /// Changes the base state, rejecting transitions the hardware cannot make.
    pub fn transition(&mut self, to: BaseState) -> Result<(), LodestarError> {
        if !Self::legal(self.base, to) {
            return Err(LodestarError::Internal(format!(
                "illegal node state transition {} -> {}",
                self.base, to
            )));
        }
        self.base = to;
        Ok(())
    }

    fn legal(from: BaseState, to: BaseState) -> bool {
        use BaseState::*;
        match (from, to) {
            // A node may always be declared down or rediscovered.
            (_, Down) | (Unknown, _) | (_, Unknown) => true,
            // A future node materializes as idle before anything runs on it.
            (Future, Idle) => true,
            (Future, _) => false,
            (_, Future) => false,
            (Down, Idle) => true,
            // Allocation cannot bypass recovery.
            (Down, Alloc) | (Down, Mix) => false,
            (Idle, Alloc) | (Idle, Mix) => true,
            (Alloc, Idle) | (Alloc, Mix) => true,
            (Mix, Idle) | (Mix, Alloc) => true,
            (Idle, Idle) | (Alloc, Alloc) | (Mix, Mix) => true,
        }
    }

    /// Sets flags while maintaining the power-state exclusions:
    /// POWERED_DOWN, POWERING_UP, and POWERING_DOWN are mutually exclusive.
    pub fn set_flag(&mut self, flag: NodeFlags) {
        if flag.intersects(NodeFlags::POWERED_DOWN) {
            self.flags
                .remove(NodeFlags::POWERING_UP | NodeFlags::POWERING_DOWN | NodeFlags::POWER_UP);
        }
        if flag.intersects(NodeFlags::POWERING_UP) {
            self.flags
                .remove(NodeFlags::POWERED_DOWN | NodeFlags::POWERING_DOWN);
        }
        if flag.intersects(NodeFlags::POWERING_DOWN) {
            self.flags.remove(NodeFlags::POWERING_UP);
        }
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: NodeFlags) {
        self.flags.remove(flag);
    }

    // --- Derived predicates ---

    pub fn is_idle(&self) -> bool {
        self.base == BaseState::Idle
    }

    pub fn is_down(&self) -> bool {
        self.base == BaseState::Down
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self.base, BaseState::Alloc | BaseState::Mix)
    }

    pub fn is_completing(&self) -> bool {
        self.flags.contains(NodeFlags::COMPLETING)
    }

    pub fn is_drained(&self) -> bool {
        self.flags.intersects(NodeFlags::DRAIN | NodeFlags::FAIL)
    }

    pub fn is_powered_down(&self) -> bool {
        self.flags.contains(NodeFlags::POWERED_DOWN)
    }

    pub fn is_powering_up(&self) -> bool {
        self.flags.contains(NodeFlags::POWERING_UP)
    }

    pub fn is_powering_down(&self) -> bool {
        self.flags.contains(NodeFlags::POWERING_DOWN)
    }

    pub fn is_power_transitioning(&self) -> bool {
        self.flags
            .intersects(NodeFlags::POWERING_UP | NodeFlags::POWERING_DOWN)
    }

    pub fn is_rebooting(&self) -> bool {
        self.flags.contains(NodeFlags::REBOOT_ISSUED)
    }

    /// Usable for new work right now.
    pub fn is_schedulable(&self) -> bool {
        !self.is_down()
            && !self.is_drained()
            && !self.flags.intersects(
                NodeFlags::NO_RESPOND
                    | NodeFlags::POWERING_DOWN
                    | NodeFlags::INVALID_REG
                    | NodeFlags::MAINT,
            )
    }
}

/// A generic per-node consumable, e.g. `gpu:4`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresSpec {
    pub name: String,
    pub count: u64,
}

impl GresSpec {
    pub fn parse(spec: &str) -> Result<Self, LodestarError> {
        match spec.split_once(':') {
            Some((name, count)) if !name.is_empty() => Ok(Self {
                name: name.to_string(),
                count: count
                    .parse()
                    .map_err(|_| LodestarError::InvalidRequest(format!("bad gres '{spec}'")))?,
            }),
            None if !spec.is_empty() => Ok(Self {
                name: spec.to_string(),
                count: 1,
            }),
            _ => Err(LodestarError::InvalidRequest(format!("bad gres '{spec}'"))),
        }
    }
}

/// One node of the cluster. Entries persist across runs and are reconciled
/// with registration reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    // --- Identity ---
    pub name: String,
    /// Stable index into the node table; bitmaps are keyed by it.
    pub index: u32,
    pub comm_addr: Option<String>,
    pub hostname: Option<String>,

    // --- Capacity ---
    pub cpus: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    /// MiB.
    pub real_memory: u64,
    /// MiB.
    pub tmp_disk: u64,
    pub gres: Vec<GresSpec>,
    pub weight: u32,

    // --- Features ---
    pub features_active: Vec<String>,
    pub features_avail: Vec<String>,
    /// Features a reboot helper can realize.
    pub features_changeable: Vec<String>,

    // --- Dynamic state ---
    pub state: NodeState,
    pub reason: Option<String>,
    /// Partition indices this node belongs to, sorted ascending.
    pub partitions: Vec<u32>,
    pub run_jobs: u32,
    pub suspended_jobs: u32,
    /// Exclusive owner uid, if a job claimed the node with exclusive-user.
    pub owner: Option<u32>,
    pub mcs_label: Option<String>,
    /// Cloud instance identifier, reset when the node powers down.
    pub instance_id: Option<String>,
    /// Opaque site-defined attributes, matched against a job's
    /// extra-constraints expression.
    pub extra: Option<serde_json::Value>,
    /// Per-node override of the cluster suspend time.
    pub suspend_time: Option<Duration>,

    // --- Timestamps (unix seconds) ---
    pub last_busy: i64,
    pub boot_req_time: Option<i64>,
    pub power_save_req_time: Option<i64>,
}

impl Node {
    /// Whether `feature` is active on the node right now.
    pub fn has_active_feature(&self, feature: &str) -> bool {
        self.features_active.iter().any(|f| f == feature)
    }

    /// Whether `feature` is available, possibly after a reboot.
    pub fn has_avail_feature(&self, feature: &str) -> bool {
        self.features_avail.iter().any(|f| f == feature)
            || self.features_changeable.iter().any(|f| f == feature)
    }

    /// Resets live statistics when the node completes a power-down.
    pub fn reset_after_power_down(&mut self) {
        self.run_jobs = 0;
        self.suspended_jobs = 0;
        self.owner = None;
        self.instance_id = None;
        // Active features fall back to the configured set.
        self.features_active = self.features_avail.clone();
    }
}

/// One entry of the suspend-exclusion state list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendExcState {
    Base(BaseState),
    Flag(NodeFlags),
}

impl SuspendExcState {
    pub fn matches(&self, state: &NodeState) -> bool {
        match self {
            SuspendExcState::Base(b) => state.base == *b,
            SuspendExcState::Flag(f) => state.flags.intersects(*f),
        }
    }
}

/// Parses a `suspend_exc_states` entry: `DOWN` or a flag name.
pub fn parse_exc_state(name: &str) -> Option<SuspendExcState> {
    if let Ok(base) = name.parse::<BaseState>() {
        return Some(SuspendExcState::Base(base));
    }
    let flag = match name.to_ascii_uppercase().as_str() {
        "DRAIN" => NodeFlags::DRAIN,
        "FAIL" => NodeFlags::FAIL,
        "MAINT" => NodeFlags::MAINT,
        "NO_RESPOND" => NodeFlags::NO_RESPOND,
        "COMPLETING" => NodeFlags::COMPLETING,
        "PLANNED" => NodeFlags::PLANNED,
        "RESERVED" => NodeFlags::RES,
        "CLOUD" => NodeFlags::CLOUD,
        "DYNAMIC_FUTURE" => NodeFlags::DYNAMIC_FUTURE,
        "DYNAMIC_NORM" => NodeFlags::DYNAMIC_NORM,
        "INVALID_REG" => NodeFlags::INVALID_REG,
        _ => return None,
    };
    Some(SuspendExcState::Flag(flag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powered_down_excludes_powering_up() {
        let mut state = NodeState::new(BaseState::Idle);
        state.set_flag(NodeFlags::POWERING_UP);
        state.set_flag(NodeFlags::POWERED_DOWN);
        assert!(state.is_powered_down());
        assert!(!state.is_powering_up());
    }

    #[test]
    fn down_cannot_go_straight_to_alloc() {
        let mut state = NodeState::new(BaseState::Down);
        assert!(state.transition(BaseState::Alloc).is_err());
        state.transition(BaseState::Idle).unwrap();
        state.transition(BaseState::Alloc).unwrap();
        assert_eq!(state.base, BaseState::Alloc);
    }

    #[test]
    fn exc_state_parsing() {
        assert_eq!(
            parse_exc_state("down"),
            Some(SuspendExcState::Base(BaseState::Down))
        );
        assert_eq!(
            parse_exc_state("DRAIN"),
            Some(SuspendExcState::Flag(NodeFlags::DRAIN))
        );
        assert_eq!(parse_exc_state("bogus"), None);
    }
}
