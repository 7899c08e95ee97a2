// src/core/types/job.rs

//! The job record: request details, allocation, and pending-state bookkeeping.

use crate::core::types::bitmap::NodeBitmap;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Suspended,
    Complete,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Suspended)
    }
}

/// Why a pending job is waiting. Stored on the job and shown to users;
/// transitions are monotone within one scheduling pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StateReason {
    #[default]
    None,
    /// Waiting for resources to free up.
    Resources,
    NodeNotAvail,
    PartNodeLimit,
    PartTimeLimit,
    Reservation,
    Licenses,
    Qos,
    Account,
    Held,
    BurstBufferStageIn,
    Priority,
    PowerUpNode,
    /// The request can never be satisfied by this partition's hardware.
    BadConstraints,
    /// Opaque node-attribute constraints did not match; the job stays
    /// pending because matching attributes may appear later.
    Constraints,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub struct JobFlags: u32 {
        const WAS_RUNNING     = 1 << 0;
        const KILL_HURRY      = 1 << 1;
        /// Allocation includes nodes that must be powered up first.
        const POWER_UP_NODE   = 1 << 2;
        const STEPMGR_ENABLED = 1 << 3;
        const JOB_MEM_SET     = 1 << 4;
        const USE_MIN_NODES   = 1 << 5;
    }
}

/// Whole-node request level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WholeNode {
    #[default]
    NotSet,
    /// `--exclusive`
    Exclusive,
    /// `--exclusive=user`
    User,
    /// `--exclusive=mcs`
    Mcs,
}

/// One license the job asked for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRequest {
    pub name: String,
    pub count: u32,
}

/// The mutable request half of a job.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct JobDetails {
    pub min_nodes: u32,
    pub max_nodes: Option<u32>,
    pub min_cpus: u32,
    pub cpus_per_task: u16,
    pub num_tasks: Option<u32>,
    pub ntasks_per_node: Option<u16>,
    pub ntasks_per_tres: Option<u16>,
    /// Per-node minimum memory in MiB.
    pub pn_min_memory: u64,
    /// Per-node minimum temporary disk in MiB.
    pub pn_min_tmp_disk: u64,
    pub time_limit: Option<Duration>,
    /// Feature expression, e.g. `a&b|c` or `[gpu*1|fpga*1]`.
    pub features: Option<String>,
    /// Opaque node-attribute constraint expression.
    pub extra_constraints: Option<String>,
    pub req_node_bitmap: Option<NodeBitmap>,
    pub exc_node_bitmap: Option<NodeBitmap>,
    pub reservation: Option<String>,
    pub qos: Option<String>,
    /// Candidate partitions in submission order.
    pub partitions: Vec<String>,
    /// Raw license request, e.g. `matlab:2`.
    pub licenses: Option<String>,
    /// Number of reserved MPI ports per node; `Some(0)` asks the controller
    /// to derive the count from the task layout.
    pub resv_port_cnt: Option<u16>,
    pub reboot: bool,
    pub whole_node: WholeNode,
    /// Explicit oversubscription request, if the user stated one.
    pub share_res: Option<bool>,
}

/// Fields the selector may clobber while probing one partition. Saved before
/// the attempt and restored on every early return so the next partition sees
/// the original request.
#[derive(Clone, Debug)]
pub struct SavedSelectFields {
    pub whole_node: WholeNode,
    pub share_res: Option<bool>,
    pub req_node_bitmap: Option<NodeBitmap>,
    pub min_cpus: u32,
    pub min_nodes: u32,
}

/// A job in the controller's job table.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Job {
    pub id: u32,
    pub array_job_id: Option<u32>,
    pub array_task_id: Option<u32>,
    pub user_id: u32,
    pub group_id: u32,
    pub account: Option<String>,
    pub mcs_label: Option<String>,
    pub state: JobState,
    pub state_reason: StateReason,
    pub state_desc: Option<String>,
    pub flags: JobFlags,
    pub details: JobDetails,
    /// Allocated nodes; `None` while pending.
    pub node_bitmap: Option<NodeBitmap>,
    /// Parsed license requests, resolved against the ledger at submission.
    pub license_list: Vec<LicenseRequest>,
    /// Jobs that would be preempted to start this one.
    pub preemptee_job_ids: Vec<u32>,
    /// Jobs holding licenses this job needs, collected by the license test
    /// when preemption for licenses is enabled.
    pub licenses_to_preempt: Vec<u32>,
    /// Partition the job was (or will be) started in.
    pub partition: Option<String>,
    /// Cloud/dynamic node address hints for the launch path.
    pub alias_list: Option<String>,
    /// Reserved MPI port range, once allocated.
    pub resv_ports: Option<String>,
    pub submit_time: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl Job {
    /// Snapshot the selector-mutable fields before probing a partition.
    pub fn save_select_fields(&self) -> SavedSelectFields {
        SavedSelectFields {
            whole_node: self.details.whole_node,
            share_res: self.details.share_res,
            req_node_bitmap: self.details.req_node_bitmap.clone(),
            min_cpus: self.details.min_cpus,
            min_nodes: self.details.min_nodes,
        }
    }

    /// Restore the selector-mutable fields after a failed attempt.
    pub fn restore_select_fields(&mut self, saved: SavedSelectFields) {
        self.details.whole_node = saved.whole_node;
        self.details.share_res = saved.share_res;
        self.details.req_node_bitmap = saved.req_node_bitmap;
        self.details.min_cpus = saved.min_cpus;
        self.details.min_nodes = saved.min_nodes;
    }

    /// Updates the pending reason. Within a pass, reasons only become more
    /// specific; a later generic reason never overwrites a specific one.
    pub fn set_reason(&mut self, reason: StateReason, desc: Option<String>) {
        if self.state_reason == StateReason::None || reason_rank(reason) >= reason_rank(self.state_reason)
        {
            self.state_reason = reason;
            self.state_desc = desc;
        }
    }
}

fn reason_rank(reason: StateReason) -> u8 {
    match reason {
        StateReason::None => 0,
        StateReason::Priority => 1,
        StateReason::Resources => 2,
        StateReason::PartNodeLimit | StateReason::PartTimeLimit => 3,
        StateReason::NodeNotAvail => 4,
        StateReason::Reservation => 5,
        StateReason::Licenses => 6,
        StateReason::Qos | StateReason::Account => 7,
        StateReason::BurstBufferStageIn => 7,
        StateReason::PowerUpNode => 7,
        StateReason::Held => 8,
        StateReason::Constraints => 8,
        StateReason::BadConstraints => 9,
    }
}
