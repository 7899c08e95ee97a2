// src/config.rs

//! Manages daemon configuration: loading, defaults, and validation.
//!
//! Invalid values are rejected here, at configuration time, before any
//! subsystem starts. Validation failures are fatal.

use crate::core::errors::LodestarError;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Identity and address of one controller instance, ordered by priority.
/// Index 0 is the primary; every later entry is a backup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    /// Hostname as reported by the instance itself; used to find our own index.
    pub hostname: String,
    /// Address the instance's peer RPC endpoint listens on.
    pub addr: String,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// Action taken when the accounting agent queue reaches `max_dbd_msgs`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MsgOverflowAction {
    /// Purge step records, then drop the incoming message if still full.
    #[default]
    Discard,
    /// Persist the queue to disk and terminate the daemon.
    Exit,
}

/// Configuration for the outbound accounting-storage agent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccountingConfig {
    /// Address of the accounting database daemon. `None` disables the agent.
    #[serde(default)]
    pub storage_addr: Option<String>,
    /// Upper bound on queued outbound messages.
    #[serde(default = "default_max_dbd_msgs")]
    pub max_dbd_msgs: usize,
    /// Overflow action once the queue is full.
    #[serde(default)]
    pub max_dbd_msg_action: MsgOverflowAction,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            storage_addr: None,
            max_dbd_msgs: default_max_dbd_msgs(),
            max_dbd_msg_action: MsgOverflowAction::default(),
        }
    }
}

fn default_max_dbd_msgs() -> usize {
    10_000
}

/// Configuration for the power-save controller.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PowerSaveConfig {
    /// Script run to suspend a set of nodes. `None` disables power save.
    #[serde(default)]
    pub suspend_program: Option<String>,
    /// Script run to resume a set of nodes.
    #[serde(default)]
    pub resume_program: Option<String>,
    /// Script run when a node fails to resume before `resume_timeout`.
    #[serde(default)]
    pub resume_fail_program: Option<String>,
    /// Default idle time before a node becomes a suspend candidate.
    #[serde(with = "humantime_serde", default = "default_suspend_time")]
    pub suspend_time: Duration,
    /// Time allowed for a suspend script to complete its transition.
    #[serde(with = "humantime_serde", default = "default_suspend_timeout")]
    pub suspend_timeout: Duration,
    /// Time allowed for a node to boot before it is marked DOWN.
    #[serde(with = "humantime_serde", default = "default_resume_timeout")]
    pub resume_timeout: Duration,
    /// Maximum suspends per minute. Zero means unlimited.
    #[serde(default = "default_suspend_rate")]
    pub suspend_rate: u32,
    /// Maximum resumes per minute. Zero means unlimited.
    #[serde(default = "default_resume_rate")]
    pub resume_rate: u32,
    /// Hostlist expression of nodes never suspended. Supports `name:N`
    /// partial exclusion, keeping N nodes of the group awake.
    #[serde(default)]
    pub suspend_exc_nodes: Option<String>,
    /// Partitions whose nodes are never suspended.
    #[serde(default)]
    pub suspend_exc_parts: Vec<String>,
    /// Node state flag names exempt from suspension (e.g. "DOWN", "DRAIN").
    #[serde(default)]
    pub suspend_exc_states: Vec<String>,
    /// Cadence of the power-save loop when nothing changed.
    #[serde(with = "humantime_serde", default = "default_power_save_interval")]
    pub power_save_interval: Duration,
    /// Lower bound on loop cadence when state churns.
    #[serde(with = "humantime_serde", default = "default_power_save_min_interval")]
    pub power_save_min_interval: Duration,
    /// Reset suspended nodes to IDLE, clearing DRAIN/FAIL.
    #[serde(default)]
    pub idle_on_node_suspend: bool,
}

impl Default for PowerSaveConfig {
    fn default() -> Self {
        Self {
            suspend_program: None,
            resume_program: None,
            resume_fail_program: None,
            suspend_time: default_suspend_time(),
            suspend_timeout: default_suspend_timeout(),
            resume_timeout: default_resume_timeout(),
            suspend_rate: default_suspend_rate(),
            resume_rate: default_resume_rate(),
            suspend_exc_nodes: None,
            suspend_exc_parts: Vec::new(),
            suspend_exc_states: Vec::new(),
            power_save_interval: default_power_save_interval(),
            power_save_min_interval: default_power_save_min_interval(),
            idle_on_node_suspend: false,
        }
    }
}

fn default_suspend_time() -> Duration {
    Duration::from_secs(300)
}
fn default_suspend_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_resume_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_suspend_rate() -> u32 {
    60
}
fn default_resume_rate() -> u32 {
    300
}
fn default_power_save_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_power_save_min_interval() -> Duration {
    Duration::ZERO
}

/// Cluster-wide preemption mode. `Gang` may not be overridden per partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PreemptMode {
    #[default]
    Off,
    Suspend,
    Requeue,
    Cancel,
    Gang,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PreemptConfig {
    #[serde(default)]
    pub mode: PreemptMode,
    /// Allow preempting running jobs to satisfy license shortfalls.
    #[serde(default)]
    pub preempt_for_licenses: bool,
}

/// Which node-selection backend computes per-node resource fits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectBackend {
    /// Track CPUs/memory per node; sharing follows the job request.
    #[default]
    ConsumableTres,
    /// Whole-node allocation unless the partition forces sharing.
    Linear,
}

/// Static definition of a group of identical nodes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeDef {
    /// Hostlist expression naming the nodes, e.g. `n[1-16]`.
    pub names: String,
    #[serde(default = "default_one_u16")]
    pub cpus: u16,
    #[serde(default = "default_one_u16")]
    pub sockets: u16,
    #[serde(default = "default_one_u16")]
    pub cores_per_socket: u16,
    #[serde(default = "default_one_u16")]
    pub threads_per_core: u16,
    /// Real memory in MiB.
    #[serde(default = "default_real_memory")]
    pub real_memory: u64,
    /// Temporary disk in MiB.
    #[serde(default)]
    pub tmp_disk: u64,
    #[serde(default = "default_node_weight")]
    pub weight: u32,
    #[serde(default)]
    pub features: Vec<String>,
    /// Features a reboot helper can realize; they count as available
    /// but not active until the node is rebooted into them.
    #[serde(default)]
    pub changeable_features: Vec<String>,
    /// Generic resources, e.g. `gpu:4`.
    #[serde(default)]
    pub gres: Vec<String>,
    /// Cloud nodes are provisioned on demand and excluded from idle pools.
    #[serde(default)]
    pub cloud: bool,
}

fn default_one_u16() -> u16 {
    1
}
fn default_real_memory() -> u64 {
    1
}
fn default_node_weight() -> u32 {
    1
}

/// Static definition of a partition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartitionDef {
    pub name: String,
    /// Hostlist expression of member nodes.
    pub nodes: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_one_u32")]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    /// Maximum job run time. `None` means unlimited.
    #[serde(with = "humantime_serde::option", default)]
    pub max_time: Option<Duration>,
    #[serde(with = "humantime_serde::option", default)]
    pub default_time: Option<Duration>,
    #[serde(default)]
    pub priority_tier: u16,
    #[serde(default = "default_one_u16")]
    pub priority_job_factor: u16,
    /// Oversubscription policy: `EXCLUSIVE`, `NO`, `YES:N`, or `FORCE:N`.
    #[serde(default = "default_max_share")]
    pub max_share: String,
    /// Per-partition preempt mode override; `gang` is rejected.
    #[serde(default)]
    pub preempt_mode: Option<PreemptMode>,
    #[serde(default)]
    pub allow_accounts: Vec<String>,
    #[serde(default)]
    pub deny_accounts: Vec<String>,
    #[serde(default)]
    pub allow_qos: Vec<String>,
    #[serde(default)]
    pub deny_qos: Vec<String>,
    #[serde(default)]
    pub allow_groups: Vec<String>,
    #[serde(default)]
    pub allow_alloc_nodes: Vec<String>,
    #[serde(default)]
    pub qos: Option<String>,
    /// Billing weights over TRES, e.g. `cpu=1.0,mem=0.25`.
    #[serde(default)]
    pub billing_weights: Option<String>,
    /// Jobs in this partition require exclusive-user node ownership.
    #[serde(default)]
    pub exclusive_user: bool,
}

fn default_one_u32() -> u32 {
    1
}
fn default_max_share() -> String {
    "NO".to_string()
}

/// The root configuration for a controller instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Initial log filter; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Ordered controller list; index 0 is the primary.
    pub controllers: Vec<ControllerConfig>,
    /// Override for this instance's hostname (defaults to the OS hostname).
    #[serde(default)]
    pub this_hostname: Option<String>,
    /// Directory for all persisted state (heartbeat, queue, tables).
    #[serde(default = "default_state_save_location")]
    pub state_save_location: String,
    /// Cadence at which the primary refreshes the heartbeat file.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Time without primary contact before a backup takes over.
    #[serde(with = "humantime_serde", default = "default_controller_timeout")]
    pub controller_timeout: Duration,
    /// Per-RPC send/receive timeout.
    #[serde(with = "humantime_serde", default = "default_msg_timeout")]
    pub msg_timeout: Duration,
    /// Cluster-wide licenses, e.g. `matlab:10,ansys`.
    #[serde(default)]
    pub licenses: Option<String>,
    /// Tolerate corrupt or missing state files instead of aborting.
    #[serde(default)]
    pub ignore_state_errors: bool,
    #[serde(default)]
    pub select_backend: SelectBackend,
    #[serde(default)]
    pub preempt: PreemptConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub power_save: PowerSaveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub partitions: Vec<PartitionDef>,
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_state_save_location() -> String {
    "/var/spool/lodestar".to_string()
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_controller_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_msg_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("failed to read configuration file '{path}'"))?;
        let cfg: Config = settings
            .try_deserialize()
            .with_context(|| format!("failed to parse configuration file '{path}'"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.controllers.is_empty() {
            return Err(anyhow!("at least one controller must be configured"));
        }

        let mut default_count = 0;
        for part in &self.partitions {
            if part.name.is_empty() || !part.name.chars().all(valid_name_char) {
                return Err(anyhow!("invalid partition name '{}'", part.name));
            }
            if part.default {
                default_count += 1;
            }
            crate::core::types::partition::SharePolicy::parse(&part.max_share)
                .map_err(|e| anyhow!("partition '{}': {}", part.name, e))?;
            if part.preempt_mode == Some(PreemptMode::Gang)
                || (self.preempt.mode == PreemptMode::Gang && part.preempt_mode.is_some())
            {
                // GANG is cluster-wide; a per-partition override cannot add or remove it.
                return Err(anyhow!(
                    "partition '{}': preempt mode GANG cannot be overridden per partition",
                    part.name
                ));
            }
        }
        if default_count > 1 {
            return Err(anyhow!("more than one partition marked as default"));
        }

        let ps = &self.power_save;
        for (key, prog) in [
            ("suspend_program", &ps.suspend_program),
            ("resume_program", &ps.resume_program),
            ("resume_fail_program", &ps.resume_fail_program),
        ] {
            if let Some(p) = prog {
                if !Path::new(p).is_absolute() {
                    return Err(anyhow!("power_save.{key} '{p}' must be an absolute path"));
                }
            }
        }
        if ps.suspend_program.is_some() != ps.resume_program.is_some() {
            return Err(anyhow!(
                "power_save.suspend_program and power_save.resume_program must both be set"
            ));
        }
        if ps.power_save_min_interval > ps.power_save_interval {
            return Err(anyhow!(
                "power_save.power_save_min_interval exceeds power_save.power_save_interval"
            ));
        }
        for state in &ps.suspend_exc_states {
            crate::core::types::node::parse_exc_state(state)
                .ok_or_else(|| anyhow!("unknown power_save.suspend_exc_states entry '{state}'"))?;
        }

        if let Some(spec) = &self.licenses {
            crate::core::license::parse_license_spec(spec)
                .map_err(|e: LodestarError| anyhow!("invalid licenses specification: {e}"))?;
        }

        if self.accounting.max_dbd_msgs == 0 {
            return Err(anyhow!("accounting.max_dbd_msgs must be greater than zero"));
        }

        Ok(())
    }

    /// The index of this instance in the ordered controller list.
    pub fn my_controller_index(&self) -> Result<usize> {
        let hostname = match &self.this_hostname {
            Some(h) => h.clone(),
            None => hostname::get_os_hostname(),
        };
        self.controllers
            .iter()
            .position(|c| c.hostname == hostname)
            .ok_or_else(|| anyhow!("hostname '{hostname}' is not in the controller list"))
    }

    /// Path of the heartbeat file under the state directory.
    pub fn heartbeat_path(&self) -> std::path::PathBuf {
        Path::new(&self.state_save_location).join("heartbeat")
    }

    /// Path of the persisted accounting-agent queue.
    pub fn dbd_messages_path(&self) -> std::path::PathBuf {
        Path::new(&self.state_save_location).join("dbd.messages")
    }

    /// Path of the persisted partition table.
    pub fn part_state_path(&self) -> std::path::PathBuf {
        Path::new(&self.state_save_location).join("part_state")
    }
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

mod hostname {
    use once_cell::sync::Lazy;

    static OS_HOSTNAME: Lazy<String> = Lazy::new(|| {
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string())
    });

    /// Best-effort OS hostname; an unresolvable hostname is only fatal for
    /// backup-capable instances, which is checked at initialization.
    pub fn get_os_hostname() -> String {
        OS_HOSTNAME.clone()
    }
}
