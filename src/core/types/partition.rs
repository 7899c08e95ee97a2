// src/core/types/partition.rs

//! The partition record and its oversubscription policy.

use crate::core::errors::LodestarError;
use crate::core::types::bitmap::NodeBitmap;
use crate::config::PreemptMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How jobs may oversubscribe nodes in a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharePolicy {
    /// One job per node set, whole nodes, no sharing ever.
    Exclusive,
    /// No sharing unless the select backend says otherwise.
    No,
    /// Sharing allowed if the job asks for it, up to N jobs per resource.
    Yes(u16),
    /// Sharing imposed on all jobs, up to N jobs per resource.
    Force(u16),
}

impl SharePolicy {
    /// Parses `EXCLUSIVE`, `NO`, `YES[:N]`, or `FORCE[:N]`.
    pub fn parse(s: &str) -> Result<Self, LodestarError> {
        let (word, count) = match s.split_once(':') {
            Some((w, c)) => {
                let n: u16 = c.parse().map_err(|_| {
                    LodestarError::ConfigError(format!("bad share policy count in '{s}'"))
                })?;
                if n == 0 {
                    return Err(LodestarError::ConfigError(format!(
                        "share policy count in '{s}' must be at least 1"
                    )));
                }
                (w, Some(n))
            }
            None => (s, None),
        };
        match (word.to_ascii_uppercase().as_str(), count) {
            ("EXCLUSIVE", None) => Ok(SharePolicy::Exclusive),
            ("NO", None) => Ok(SharePolicy::No),
            ("YES", n) => Ok(SharePolicy::Yes(n.unwrap_or(4))),
            ("FORCE", n) => Ok(SharePolicy::Force(n.unwrap_or(4))),
            _ => Err(LodestarError::ConfigError(format!(
                "unknown share policy '{s}'"
            ))),
        }
    }

    /// The maximum number of jobs that may share one resource.
    pub fn max_share(&self) -> u16 {
        match self {
            SharePolicy::Exclusive => 0,
            SharePolicy::No => 1,
            SharePolicy::Yes(n) | SharePolicy::Force(n) => *n,
        }
    }
}

impl std::fmt::Display for SharePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharePolicy::Exclusive => write!(f, "EXCLUSIVE"),
            SharePolicy::No => write!(f, "NO"),
            SharePolicy::Yes(n) => write!(f, "YES:{n}"),
            SharePolicy::Force(n) => write!(f, "FORCE:{n}"),
        }
    }
}

/// A partition: a named, ordered set of nodes with scheduling policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// Stable index into the partition table.
    pub index: u32,
    /// Hostlist expression the membership was built from.
    pub node_expr: String,
    pub node_bitmap: NodeBitmap,
    /// Always equals the set-bit count of `node_bitmap`.
    pub total_nodes: u32,
    pub total_cpus: u32,
    pub is_default: bool,
    pub state_up: bool,
    pub min_nodes: u32,
    pub max_nodes: Option<u32>,
    pub max_time: Option<Duration>,
    pub default_time: Option<Duration>,
    pub priority_tier: u16,
    pub priority_job_factor: u16,
    pub preempt_mode: Option<PreemptMode>,
    pub share: SharePolicy,
    pub allow_accounts: Vec<String>,
    pub deny_accounts: Vec<String>,
    pub allow_qos: Vec<String>,
    pub deny_qos: Vec<String>,
    pub allow_groups: Vec<String>,
    pub allow_alloc_nodes: Vec<String>,
    pub qos: Option<String>,
    /// Billing weights over TRES names.
    pub billing_weights: Vec<(String, f64)>,
    /// Computed TRES counts (cpu, mem, node, ...) refreshed on membership change.
    pub tres_cnt: Vec<(String, u64)>,
    pub exclusive_user: bool,
    /// Running + completing jobs in this partition.
    pub job_count: u32,
}

impl Partition {
    /// Account admission: a deny list is advisory once an allow list exists.
    pub fn account_allowed(&self, account: &str) -> bool {
        if !self.allow_accounts.is_empty() {
            return self.allow_accounts.iter().any(|a| a == account);
        }
        !self.deny_accounts.iter().any(|a| a == account)
    }

    pub fn qos_allowed(&self, qos: &str) -> bool {
        if !self.allow_qos.is_empty() {
            return self.allow_qos.iter().any(|q| q == qos);
        }
        !self.deny_qos.iter().any(|q| q == qos)
    }

    /// Recomputes node-derived counters after a membership change.
    pub fn refresh_totals(&mut self, cpus_of: impl Fn(usize) -> u32, mem_of: impl Fn(usize) -> u64) {
        self.total_nodes = self.node_bitmap.count() as u32;
        let mut cpus = 0u32;
        let mut mem = 0u64;
        for idx in self.node_bitmap.iter_ones() {
            cpus += cpus_of(idx);
            mem += mem_of(idx);
        }
        self.total_cpus = cpus;
        self.tres_cnt = vec![
            ("cpu".to_string(), cpus as u64),
            ("mem".to_string(), mem),
            ("node".to_string(), self.total_nodes as u64),
        ];
    }
}
