// src/core/state/core.rs

//! Defines the central `SharedState` struct, holding all controller-wide state.

use super::locks::{
    OrderedRwLock, RAIL_CONF, RAIL_FED, RAIL_JOB, RAIL_NODE, RAIL_PART, RAIL_RESV,
};
use super::tables::{JobTable, NodeTable, PartTable, ResvTable, UpdateStamps};
use crate::config::Config;
use crate::core::agent::AgentQueue;
use crate::core::errors::LodestarError;
use crate::core::license::LicenseLedger;
use crate::core::power::ResumeRequest;
use crate::core::types::job::{Job, JobState};
use crate::core::types::partition::{Partition, SharePolicy};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64};
use tokio::sync::{Mutex, Notify};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Federation-mirrored state: remote license updates and peer liveness.
#[derive(Debug, Default)]
pub struct FedState {
    /// Unix seconds of the last update received from the federation DB.
    pub last_remote_update: i64,
}

/// Conf-rail state: everything derived purely from the configuration file.
#[derive(Debug)]
pub struct ConfState {
    pub cluster_name: String,
}

/// Contains the initialized shared state plus the pieces the task spawner
/// consumes. Created once during initialization.
pub struct ServerInit {
    pub state: Arc<SharedState>,
}

/// The central struct holding all shared, controller-wide state.
/// Wrapped in an `Arc` and passed to every background task, providing a
/// single source of truth for configuration and dynamic state.
#[derive(Debug)]
pub struct SharedState {
    /// The runtime configuration, wrapped in a Mutex to allow dynamic changes.
    pub config: Arc<Mutex<Config>>,

    // --- Lock rails over the cluster tables (fixed acquisition order) ---
    pub conf: OrderedRwLock<ConfState>,
    pub jobs: OrderedRwLock<JobTable>,
    pub nodes: OrderedRwLock<NodeTable>,
    pub parts: OrderedRwLock<PartTable>,
    pub resvs: OrderedRwLock<ResvTable>,
    pub fed: OrderedRwLock<FedState>,

    /// Monotone per-table update stamps, bumped on any mutation.
    pub stamps: UpdateStamps,

    /// The license ledger, behind its own mutex (acquired after any rail).
    pub licenses: PlMutex<LicenseLedger>,

    /// The outbound accounting-storage queue.
    pub agent: Arc<AgentQueue>,

    /// Jobs waiting for node power-up, consumed by the power-save loop.
    pub resume_job_list: PlMutex<Vec<ResumeRequest>>,
    /// Wakes the power-save loop early when state changed.
    pub power_kick: Notify,

    /// Random identity for this daemon run, used in peer status replies to
    /// distinguish a restart from a hung instance.
    pub run_id: String,
    /// This instance's index in the ordered controller list.
    pub my_index: usize,
    /// Whether this instance currently holds control.
    pub is_primary: AtomicBool,
    /// Unix seconds at which this instance took control, 0 if never.
    pub control_time: AtomicI64,
    /// Unix seconds of the last response from a higher-priority controller.
    pub last_controller_response: AtomicI64,

    /// A handle to the logging filter, allowing dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl SharedState {
    /// Initializes the entire controller state from the given configuration.
    /// This is the main factory function for creating the shared context.
    pub fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<ServerInit, LodestarError> {
        let my_index = config
            .my_controller_index()
            .map_err(|e| LodestarError::ConfigError(e.to_string()))?;

        // Generate a unique run ID for this daemon instance.
        let mut run_id_bytes = [0u8; 20];
        getrandom::fill(&mut run_id_bytes).map_err(|e| LodestarError::Internal(e.to_string()))?;
        let run_id = hex::encode(run_id_bytes);

        let mut node_table = NodeTable::from_defs(&config.nodes)?;

        let mut part_table = PartTable::default();
        for def in &config.partitions {
            let node_bitmap = node_table.bitmap_from_expr(&def.nodes)?;
            let share = SharePolicy::parse(&def.max_share)?;
            let mut part = Partition {
                name: def.name.clone(),
                index: 0,
                node_expr: def.nodes.clone(),
                node_bitmap,
                total_nodes: 0,
                total_cpus: 0,
                is_default: def.default,
                state_up: true,
                min_nodes: def.min_nodes,
                max_nodes: def.max_nodes,
                max_time: def.max_time,
                default_time: def.default_time,
                priority_tier: def.priority_tier,
                priority_job_factor: def.priority_job_factor,
                preempt_mode: def.preempt_mode,
                share,
                allow_accounts: def.allow_accounts.clone(),
                deny_accounts: def.deny_accounts.clone(),
                allow_qos: def.allow_qos.clone(),
                deny_qos: def.deny_qos.clone(),
                allow_groups: def.allow_groups.clone(),
                allow_alloc_nodes: def.allow_alloc_nodes.clone(),
                qos: def.qos.clone(),
                billing_weights: parse_billing_weights(def.billing_weights.as_deref())?,
                tres_cnt: Vec::new(),
                exclusive_user: def.exclusive_user,
                job_count: 0,
            };
            part.refresh_totals(
                |i| node_table.get(i as u32).map_or(0, |n| n.cpus as u32),
                |i| node_table.get(i as u32).map_or(0, |n| n.real_memory),
            );
            let part_index = part_table.create(part)?;

            // Back-references: each node keeps a sorted list of its partitions.
            let member_bitmap = part_table.get(part_index).unwrap().node_bitmap.clone();
            for node_idx in member_bitmap.iter_ones() {
                if let Some(node) = node_table.get_mut(node_idx as u32) {
                    if let Err(pos) = node.partitions.binary_search(&part_index) {
                        node.partitions.insert(pos, part_index);
                    }
                }
            }
        }

        let licenses = match &config.licenses {
            Some(spec) => LicenseLedger::from_config(spec)?,
            None => LicenseLedger::default(),
        };

        let agent = Arc::new(AgentQueue::new(
            config.accounting.clone(),
            config.dbd_messages_path(),
        ));

        let state = Arc::new(Self {
            conf: OrderedRwLock::new(
                RAIL_CONF,
                "conf",
                ConfState {
                    cluster_name: config.cluster_name.clone(),
                },
            ),
            jobs: OrderedRwLock::new(RAIL_JOB, "job", JobTable::default()),
            nodes: OrderedRwLock::new(RAIL_NODE, "node", node_table),
            parts: OrderedRwLock::new(RAIL_PART, "part", part_table),
            resvs: OrderedRwLock::new(RAIL_RESV, "resv", ResvTable::default()),
            fed: OrderedRwLock::new(RAIL_FED, "fed", FedState::default()),
            stamps: UpdateStamps::default(),
            licenses: PlMutex::new(licenses),
            agent,
            resume_job_list: PlMutex::new(Vec::new()),
            power_kick: Notify::new(),
            run_id,
            my_index,
            is_primary: AtomicBool::new(my_index == 0),
            control_time: AtomicI64::new(0),
            last_controller_response: AtomicI64::new(0),
            config: Arc::new(Mutex::new(config)),
            log_reload_handle,
        });

        info!(
            "Cluster state initialized: {} nodes, {} partitions (run id {}).",
            state.nodes.read().len(),
            state.parts.read().len(),
            state.run_id
        );

        Ok(ServerInit { state })
    }

    /// Admits a job into the job table. The raw license request is resolved
    /// against the ledger here, at submission, so the scheduler only ever
    /// sees requests whose names exist; an unknown license rejects the job.
    ///
    /// `must_exist` is false when restoring jobs carried over from saved
    /// state or a peer cluster whose license configuration changed: unknown
    /// names are dropped instead of failing the whole job.
    pub fn submit_job(&self, mut job: Job, must_exist: bool) -> Result<u32, LodestarError> {
        let mut jobs = self.jobs.write();
        if let Some(req) = &job.details.licenses {
            let ledger = self.licenses.lock();
            job.license_list = ledger.validate(req, must_exist)?;
        }
        job.state = JobState::Pending;
        let id = job.id;
        jobs.insert(job);
        UpdateStamps::bump(&self.stamps.last_job_update);
        Ok(id)
    }

    /// Packs a consistent snapshot of the partition table for peer queries.
    /// Runs under the part-read rail so readers see one moment in time.
    pub fn pack_partitions(&self) -> serde_json::Value {
        let parts = self.parts.read();
        let packed: Vec<serde_json::Value> = parts
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "nodes": p.node_expr,
                    "total_nodes": p.total_nodes,
                    "total_cpus": p.total_cpus,
                    "default": p.is_default,
                    "state_up": p.state_up,
                    "share": p.share.to_string(),
                    "priority_tier": p.priority_tier,
                })
            })
            .collect();
        serde_json::Value::Array(packed)
    }

    /// Packs a consistent snapshot of the license ledger.
    pub fn pack_licenses(&self) -> serde_json::Value {
        self.licenses.lock().pack()
    }

    /// Changes the log filter at runtime, e.g. from an admin RPC.
    pub fn set_log_filter(&self, filter: &str) -> Result<(), LodestarError> {
        let parsed = filter
            .parse::<EnvFilter>()
            .map_err(|e| LodestarError::InvalidRequest(format!("bad log filter: {e}")))?;
        self.log_reload_handle
            .reload(parsed)
            .map_err(|e| LodestarError::Internal(format!("log filter reload failed: {e}")))?;
        info!("Log filter changed to '{filter}'");
        Ok(())
    }
}

fn parse_billing_weights(spec: Option<&str>) -> Result<Vec<(String, f64)>, LodestarError> {
    let Some(spec) = spec else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for item in spec.split(',') {
        let (name, weight) = item.split_once('=').ok_or_else(|| {
            LodestarError::ConfigError(format!("bad billing weight entry '{item}'"))
        })?;
        let weight: f64 = weight.parse().map_err(|_| {
            LodestarError::ConfigError(format!("bad billing weight value '{item}'"))
        })?;
        out.push((name.trim().to_string(), weight));
    }
    Ok(out)
}
