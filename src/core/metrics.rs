// src/core/metrics.rs

//! Defines and registers Prometheus metrics for controller monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, GaugeVec, TextEncoder, register_counter, register_gauge, register_gauge_vec,
};

lazy_static! {
    // --- Cluster state gauges ---
    /// Node counts by base state (idle, alloc, mix, down, future, unknown).
    pub static ref NODES_BY_STATE: GaugeVec =
        register_gauge_vec!("lodestar_nodes", "Node count by base state.", &["state"]).unwrap();
    /// The number of nodes currently powered down.
    pub static ref NODES_POWERED_DOWN: Gauge =
        register_gauge!("lodestar_nodes_powered_down", "Number of nodes currently powered down.").unwrap();
    /// The number of jobs in the pending state.
    pub static ref JOBS_PENDING: Gauge =
        register_gauge!("lodestar_jobs_pending", "Number of pending jobs.").unwrap();
    /// The number of jobs in the running state.
    pub static ref JOBS_RUNNING: Gauge =
        register_gauge!("lodestar_jobs_running", "Number of running jobs.").unwrap();

    // --- License gauges ---
    /// License usage per license name.
    pub static ref LICENSES_USED: GaugeVec =
        register_gauge_vec!("lodestar_licenses_used", "Licenses in use, by name.", &["name"]).unwrap();

    // --- Accounting agent ---
    /// Depth of the outbound accounting message queue.
    pub static ref AGENT_QUEUE_DEPTH: Gauge =
        register_gauge!("lodestar_agent_queue_depth", "Messages waiting for the accounting storage.").unwrap();
    /// Total messages delivered to the accounting storage.
    pub static ref AGENT_MESSAGES_SENT_TOTAL: Counter =
        register_counter!("lodestar_agent_messages_sent_total", "Total accounting messages delivered.").unwrap();
    /// Total messages dropped by the queue overflow policy.
    pub static ref AGENT_MESSAGES_DROPPED_TOTAL: Counter =
        register_counter!("lodestar_agent_messages_dropped_total", "Total accounting messages dropped on overflow.").unwrap();

    // --- Power save ---
    /// Total node suspend operations issued.
    pub static ref POWER_SUSPENDS_TOTAL: Counter =
        register_counter!("lodestar_power_suspends_total", "Total node suspend operations issued.").unwrap();
    /// Total node resume operations issued.
    pub static ref POWER_RESUMES_TOTAL: Counter =
        register_counter!("lodestar_power_resumes_total", "Total node resume operations issued.").unwrap();
    /// Total nodes marked DOWN after exceeding the resume timeout.
    pub static ref POWER_RESUME_TIMEOUTS_TOTAL: Counter =
        register_counter!("lodestar_power_resume_timeouts_total", "Total nodes failed by resume timeout.").unwrap();

    // --- Scheduler ---
    /// Total successful node allocations.
    pub static ref SCHED_ALLOCATIONS_TOTAL: Counter =
        register_counter!("lodestar_sched_allocations_total", "Total successful job allocations.").unwrap();
}

/// Gathers every registered metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
