// src/core/state/tables.rs

//! The cluster tables: nodes, partitions, jobs, reservations, configuration
//! records, and the cluster-wide bitmaps derived from node state.
//!
//! Entities live in arenas with stable u32 indices; cross-references are
//! indices, never pointers, so the tables can be saved, restored and packed
//! for RPCs without chasing a cyclic graph.

use crate::config::NodeDef;
use crate::core::errors::LodestarError;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::hostlist;
use crate::core::types::job::{Job, JobState};
use crate::core::types::node::{BaseState, GresSpec, Node, NodeFlags, NodeState};
use crate::core::types::partition::Partition;
use crate::core::types::reservation::Reservation;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// A configuration record: one homogeneous group of nodes as declared in the
/// configuration file. Node-set construction iterates these.
#[derive(Clone, Debug)]
pub struct ConfigRecord {
    pub node_bitmap: NodeBitmap,
    pub cpus: u16,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub weight: u32,
    pub features: Vec<String>,
    pub changeable_features: Vec<String>,
}

/// Monotone per-table update stamps. Readers compare against a cached value
/// to invalidate derived data.
#[derive(Debug, Default)]
pub struct UpdateStamps {
    pub last_node_update: AtomicI64,
    pub last_part_update: AtomicI64,
    pub last_license_update: AtomicI64,
    pub last_job_update: AtomicI64,
}

impl UpdateStamps {
    pub fn bump(stamp: &AtomicI64) {
        let now = chrono::Utc::now().timestamp();
        // Strictly monotone, even when mutations land within one second.
        let _ = stamp.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            Some(now.max(prev + 1))
        });
    }
}

/// The cluster-wide bitmaps, all keyed by node index.
#[derive(Clone, Debug)]
pub struct ClusterBitmaps {
    /// Nodes usable for scheduling decisions.
    pub avail: NodeBitmap,
    pub idle: NodeBitmap,
    /// Nodes running shareable work.
    pub share: NodeBitmap,
    /// Nodes with completing jobs.
    pub cg: NodeBitmap,
    pub power_up: NodeBitmap,
    pub power_down: NodeBitmap,
    /// Nodes mid-boot (resume or reboot issued).
    pub booting: NodeBitmap,
    pub cloud: NodeBitmap,
    /// Nodes waiting for an as-soon-as-possible reboot.
    pub asap_reboot: NodeBitmap,
    pub up: NodeBitmap,
    pub future: NodeBitmap,
}

impl ClusterBitmaps {
    pub fn new(len: usize) -> Self {
        Self {
            avail: NodeBitmap::new(len),
            idle: NodeBitmap::new(len),
            share: NodeBitmap::new(len),
            cg: NodeBitmap::new(len),
            power_up: NodeBitmap::new(len),
            power_down: NodeBitmap::new(len),
            booting: NodeBitmap::new(len),
            cloud: NodeBitmap::new(len),
            asap_reboot: NodeBitmap::new(len),
            up: NodeBitmap::new(len),
            future: NodeBitmap::new(len),
        }
    }
}

/// The node table plus the bitmaps derived from it. Mutations require the
/// node-write rail.
#[derive(Debug)]
pub struct NodeTable {
    nodes: Vec<Node>,
    by_name: HashMap<String, u32>,
    pub bitmaps: ClusterBitmaps,
    /// Configuration records in declaration order.
    pub config_records: Vec<ConfigRecord>,
}

impl NodeTable {
    /// Builds the table from configuration node definitions.
    pub fn from_defs(defs: &[NodeDef]) -> Result<Self, LodestarError> {
        let mut nodes = Vec::new();
        let mut by_name = HashMap::new();
        let mut groups: Vec<(Vec<u32>, NodeDef)> = Vec::new();

        let now = chrono::Utc::now().timestamp();
        for def in defs {
            let names = hostlist::expand(&def.names)?;
            let mut members = Vec::new();
            for name in names {
                if by_name.contains_key(&name) {
                    return Err(LodestarError::InvalidNodeName(format!(
                        "node '{name}' defined more than once"
                    )));
                }
                let index = nodes.len() as u32;
                let mut state = NodeState::new(BaseState::Unknown);
                if def.cloud {
                    state.set_flag(NodeFlags::CLOUD);
                    state.set_flag(NodeFlags::POWERED_DOWN);
                }
                let gres = def
                    .gres
                    .iter()
                    .map(|g| GresSpec::parse(g))
                    .collect::<Result<Vec<_>, _>>()?;
                by_name.insert(name.clone(), index);
                nodes.push(Node {
                    name,
                    index,
                    comm_addr: None,
                    hostname: None,
                    cpus: def.cpus,
                    sockets: def.sockets,
                    cores_per_socket: def.cores_per_socket,
                    threads_per_core: def.threads_per_core,
                    real_memory: def.real_memory,
                    tmp_disk: def.tmp_disk,
                    gres,
                    weight: def.weight,
                    features_active: def.features.clone(),
                    features_avail: def.features.clone(),
                    features_changeable: def.changeable_features.clone(),
                    state,
                    reason: None,
                    partitions: Vec::new(),
                    run_jobs: 0,
                    suspended_jobs: 0,
                    owner: None,
                    mcs_label: None,
                    instance_id: None,
                    extra: None,
                    suspend_time: None,
                    last_busy: now,
                    boot_req_time: None,
                    power_save_req_time: None,
                });
                members.push(index);
            }
            groups.push((members, def.clone()));
        }

        let len = nodes.len();
        let mut config_records = Vec::new();
        for (members, def) in groups {
            let mut bm = NodeBitmap::new(len);
            for idx in members {
                bm.set(idx as usize);
            }
            config_records.push(ConfigRecord {
                node_bitmap: bm,
                cpus: def.cpus,
                real_memory: def.real_memory,
                tmp_disk: def.tmp_disk,
                weight: def.weight,
                features: def.features,
                changeable_features: def.changeable_features,
            });
        }

        let mut table = Self {
            nodes,
            by_name,
            bitmaps: ClusterBitmaps::new(len),
            config_records,
        };
        table.rebuild_bitmaps();
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Node> {
        self.nodes.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.nodes.get_mut(index as usize)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).and_then(|i| self.get(*i))
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Builds a bitmap from a hostlist expression over this table.
    pub fn bitmap_from_expr(&self, expr: &str) -> Result<NodeBitmap, LodestarError> {
        let mut bm = NodeBitmap::new(self.len());
        for name in hostlist::expand(expr)? {
            let idx = self
                .index_of(&name)
                .ok_or(LodestarError::InvalidNodeName(name))?;
            bm.set(idx as usize);
        }
        Ok(bm)
    }

    /// Formats a bitmap back into a hostlist expression.
    pub fn expr_from_bitmap(&self, bm: &NodeBitmap) -> String {
        let names: Vec<String> = bm
            .iter_ones()
            .filter_map(|i| self.get(i as u32).map(|n| n.name.clone()))
            .collect();
        hostlist::compress(&names)
    }

    /// Applies a node daemon's registration report: reconcile the reported
    /// hardware against the configuration, clear the no-response flag, and
    /// finish any boot in progress. A report smaller than the configured
    /// capacity invalidates the registration and drains the node.
    pub fn reconcile_registration(
        &mut self,
        reg: &NodeRegistration,
    ) -> Result<(), LodestarError> {
        let index = self
            .index_of(&reg.name)
            .ok_or_else(|| LodestarError::InvalidNodeName(reg.name.clone()))?;
        let node = self.get_mut(index).unwrap();

        if reg.cpus < node.cpus || reg.real_memory < node.real_memory {
            node.state.set_flag(NodeFlags::INVALID_REG | NodeFlags::DRAIN);
            node.reason = Some(format!(
                "registration below configured size ({} cpus/{} MiB, configured {}/{})",
                reg.cpus, reg.real_memory, node.cpus, node.real_memory
            ));
        } else {
            node.state.clear_flag(NodeFlags::INVALID_REG);
        }

        node.state.clear_flag(NodeFlags::NO_RESPOND);
        if node.state.is_powering_up() {
            node.state
                .clear_flag(NodeFlags::POWERING_UP | NodeFlags::POWER_UP);
            node.boot_req_time = None;
        }
        node.state.clear_flag(NodeFlags::REBOOT_ISSUED);
        if node.state.base == BaseState::Unknown || node.state.base == BaseState::Future {
            node.state.transition(BaseState::Idle)?;
        }
        node.hostname = Some(reg.hostname.clone());
        node.comm_addr = Some(reg.comm_addr.clone());
        node.instance_id = reg.instance_id.clone();

        self.rebuild_bitmaps();
        Ok(())
    }

    /// Recomputes every cluster bitmap from the per-node states. Called after
    /// restore and by any operation that changed state wholesale.
    pub fn rebuild_bitmaps(&mut self) {
        let len = self.nodes.len();
        let mut bm = ClusterBitmaps::new(len);
        for node in &self.nodes {
            let i = node.index as usize;
            let s = &node.state;
            // Powered-down nodes stay available: the power controller can
            // wake them. Nodes mid-shutdown do not.
            if s.is_schedulable() {
                bm.avail.set(i);
            }
            if s.is_idle() && !s.is_completing() {
                bm.idle.set(i);
            }
            if s.is_completing() {
                bm.cg.set(i);
            }
            if s.flags.contains(NodeFlags::POWER_UP) || s.is_powering_up() {
                bm.power_up.set(i);
            }
            if s.is_powered_down() || s.is_powering_down() {
                bm.power_down.set(i);
            }
            if s.is_powering_up() || s.is_rebooting() {
                bm.booting.set(i);
            }
            if s.flags.contains(NodeFlags::CLOUD) {
                bm.cloud.set(i);
            }
            if s.flags.contains(NodeFlags::REBOOT_REQUESTED)
                && s.flags.contains(NodeFlags::POWER_DOWN_ASAP)
            {
                bm.asap_reboot.set(i);
            }
            if !s.is_down() && s.base != BaseState::Future {
                bm.up.set(i);
            }
            if s.base == BaseState::Future {
                bm.future.set(i);
            }
        }
        self.bitmaps = bm;
    }
}

/// A node daemon's registration report.
#[derive(Clone, Debug)]
pub struct NodeRegistration {
    pub name: String,
    pub hostname: String,
    pub comm_addr: String,
    pub cpus: u16,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub instance_id: Option<String>,
}

/// The partition arena. Deleted slots stay as `None` so indices held by
/// nodes and jobs remain stable.
#[derive(Debug, Default)]
pub struct PartTable {
    parts: Vec<Option<Partition>>,
    by_name: HashMap<String, u32>,
    default_index: Option<u32>,
}

impl PartTable {
    pub fn create(&mut self, part: Partition) -> Result<u32, LodestarError> {
        if part.name.is_empty() {
            return Err(LodestarError::InvalidPartitionName(part.name));
        }
        if self.by_name.contains_key(&part.name) {
            return Err(LodestarError::DuplicatePartition(part.name));
        }
        let index = self.parts.len() as u32;
        let mut part = part;
        part.index = index;
        if part.is_default {
            // Last marked default wins; earlier ones are demoted.
            if let Some(prev) = self.default_index {
                if let Some(Some(p)) = self.parts.get_mut(prev as usize) {
                    p.is_default = false;
                }
            }
            self.default_index = Some(index);
        }
        self.by_name.insert(part.name.clone(), index);
        self.parts.push(Some(part));
        Ok(index)
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.by_name
            .get(name)
            .and_then(|i| self.parts.get(*i as usize))
            .and_then(|p| p.as_ref())
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Partition> {
        let idx = *self.by_name.get(name)?;
        self.parts.get_mut(idx as usize)?.as_mut()
    }

    pub fn get(&self, index: u32) -> Option<&Partition> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    pub fn delete(&mut self, name: &str) -> Result<Partition, LodestarError> {
        let index = self
            .by_name
            .remove(name)
            .ok_or_else(|| LodestarError::InvalidPartitionName(name.to_string()))?;
        if self.default_index == Some(index) {
            self.default_index = None;
        }
        let slot = &mut self.parts[index as usize];
        slot.take()
            .ok_or_else(|| LodestarError::InvalidPartitionName(name.to_string()))
    }

    pub fn default_partition(&self) -> Option<&Partition> {
        self.default_index.and_then(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter().filter_map(|p| p.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.parts.iter_mut().filter_map(|p| p.as_mut())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// The job table, keyed by id with an array-task secondary index. Iteration
/// order is submission order.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: IndexMap<u32, Job>,
    array_index: HashMap<(u32, u32), u32>,
}

impl JobTable {
    pub fn insert(&mut self, job: Job) {
        if let (Some(parent), Some(task)) = (job.array_job_id, job.array_task_id) {
            self.array_index.insert((parent, task), job.id);
        }
        self.jobs.insert(job.id, job);
    }

    pub fn find(&self, id: u32) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn find_array_task(&self, array_job_id: u32, task_id: u32) -> Option<&Job> {
        self.array_index
            .get(&(array_job_id, task_id))
            .and_then(|id| self.jobs.get(id))
    }

    pub fn remove(&mut self, id: u32) -> Option<Job> {
        let job = self.jobs.shift_remove(&id)?;
        if let (Some(parent), Some(task)) = (job.array_job_id, job.array_task_id) {
            self.array_index.remove(&(parent, task));
        }
        Some(job)
    }

    /// Iterates jobs matching a predicate.
    pub fn iter_matching<'a>(
        &'a self,
        pred: impl Fn(&Job) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Job> {
        self.jobs.values().filter(move |j| pred(j))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub fn running_on_node(&self, node_index: u32) -> usize {
        self.jobs
            .values()
            .filter(|j| {
                j.state == JobState::Running
                    && j.node_bitmap
                        .as_ref()
                        .is_some_and(|bm| bm.test(node_index as usize))
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// The reservation table.
#[derive(Debug, Default)]
pub struct ResvTable {
    resvs: Vec<Reservation>,
}

impl ResvTable {
    pub fn insert(&mut self, resv: Reservation) {
        self.resvs.push(resv);
    }

    pub fn find(&self, name: &str) -> Option<&Reservation> {
        self.resvs.iter().find(|r| r.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Reservation> {
        let pos = self.resvs.iter().position(|r| r.name == name)?;
        Some(self.resvs.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.resvs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::partition::SharePolicy;

    fn part(name: &str, default: bool) -> Partition {
        Partition {
            name: name.to_string(),
            index: 0,
            node_expr: String::new(),
            node_bitmap: NodeBitmap::new(4),
            total_nodes: 0,
            total_cpus: 0,
            is_default: default,
            state_up: true,
            min_nodes: 1,
            max_nodes: None,
            max_time: None,
            default_time: None,
            priority_tier: 0,
            priority_job_factor: 1,
            preempt_mode: None,
            share: SharePolicy::No,
            allow_accounts: vec![],
            deny_accounts: vec![],
            allow_qos: vec![],
            deny_qos: vec![],
            allow_groups: vec![],
            allow_alloc_nodes: vec![],
            qos: None,
            billing_weights: vec![],
            tres_cnt: vec![],
            exclusive_user: false,
            job_count: 0,
        }
    }

    #[test]
    fn partition_create_find_delete() {
        let mut table = PartTable::default();
        let idx = table.create(part("batch", true)).unwrap();
        assert_eq!(table.find("batch").unwrap().index, idx);
        assert_eq!(table.default_partition().unwrap().name, "batch");

        let err = table.create(part("batch", false)).unwrap_err();
        assert_eq!(err, LodestarError::DuplicatePartition("batch".into()));

        table.delete("batch").unwrap();
        assert!(table.find("batch").is_none());
        assert!(table.default_partition().is_none());
    }

    #[test]
    fn single_default_partition() {
        let mut table = PartTable::default();
        table.create(part("a", true)).unwrap();
        table.create(part("b", true)).unwrap();
        assert_eq!(table.default_partition().unwrap().name, "b");
        assert_eq!(table.iter().filter(|p| p.is_default).count(), 1);
    }

    #[test]
    fn registration_reconciles_and_invalidates() {
        let defs = vec![crate::config::NodeDef {
            names: "n1".into(),
            cpus: 8,
            sockets: 1,
            cores_per_socket: 8,
            threads_per_core: 1,
            real_memory: 4096,
            tmp_disk: 0,
            weight: 1,
            features: vec![],
            changeable_features: vec![],
            gres: vec![],
            cloud: false,
        }];
        let mut table = NodeTable::from_defs(&defs).unwrap();

        table
            .reconcile_registration(&NodeRegistration {
                name: "n1".into(),
                hostname: "n1.example".into(),
                comm_addr: "10.0.0.11:7818".into(),
                cpus: 8,
                real_memory: 4096,
                tmp_disk: 0,
                instance_id: None,
            })
            .unwrap();
        let node = table.find_by_name("n1").unwrap();
        assert_eq!(node.state.base, BaseState::Idle);
        assert!(!node.state.flags.contains(NodeFlags::INVALID_REG));
        assert!(table.bitmaps.idle.test(0));

        // Undersized report: registration is invalid and the node drains.
        table
            .reconcile_registration(&NodeRegistration {
                name: "n1".into(),
                hostname: "n1.example".into(),
                comm_addr: "10.0.0.11:7818".into(),
                cpus: 4,
                real_memory: 4096,
                tmp_disk: 0,
                instance_id: None,
            })
            .unwrap();
        let node = table.find_by_name("n1").unwrap();
        assert!(node.state.flags.contains(NodeFlags::INVALID_REG));
        assert!(node.state.is_drained());
        assert!(!table.bitmaps.avail.test(0));
    }

    #[test]
    fn node_table_expr_round_trip() {
        let defs = vec![crate::config::NodeDef {
            names: "n[1-4]".into(),
            cpus: 4,
            sockets: 1,
            cores_per_socket: 4,
            threads_per_core: 1,
            real_memory: 1024,
            tmp_disk: 0,
            weight: 1,
            features: vec![],
            changeable_features: vec![],
            gres: vec![],
            cloud: false,
        }];
        let table = NodeTable::from_defs(&defs).unwrap();
        assert_eq!(table.len(), 4);
        let bm = table.bitmap_from_expr("n[2-3]").unwrap();
        assert_eq!(table.expr_from_bitmap(&bm), "n[2-3]");
        assert!(table.bitmap_from_expr("n9").is_err());
    }
}
