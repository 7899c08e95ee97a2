// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum LodestarError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("IO Error: {0}")]
    IoString(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("State file corrupt: {0}")]
    StateFileCorrupt(String),

    #[error("Lock acquired out of order: {0}")]
    LockOrder(String),

    // --- Boundary scheduling errors ---
    /// Requested nodes are allocated to other jobs right now.
    #[error("Requested nodes are busy")]
    NodesBusy,

    /// Requested nodes are down, draining, or otherwise unusable.
    #[error("Required node not available (down, drained or reserved)")]
    NodeNotAvail,

    /// The job's node requirements can never be met by the partition's hardware.
    #[error("Requested node configuration is not available")]
    RequestedNodeConfigUnavailable,

    /// The job's size or time requirements exceed the partition's limits.
    #[error("Requested partition configuration not available now")]
    RequestedPartConfigUnavailable,

    #[error("Requested nodes are busy in an advance reservation")]
    ReservationBusy,

    #[error("Required reservation is in maintenance")]
    ReservationMaint,

    #[error("Requested reservation is not usable")]
    ReservationNotUsable,

    #[error("Licenses unavailable")]
    LicensesUnavailable,

    #[error("Job violates accounting/QOS policy")]
    AccountingPolicy,

    #[error("Invalid QOS specification")]
    InvalidQos,

    #[error("Invalid account specified")]
    InvalidAccount,

    #[error("Waiting for burst buffer stage-in")]
    BurstBufferWait,

    #[error("Maximum number of powered up nodes reached")]
    MaxPoweredNodes,

    #[error("Job is held")]
    JobHeld,

    #[error("Invalid node count specified")]
    InvalidNodeCount,

    // --- License ledger errors ---
    #[error("License '{0}' is not defined")]
    LicenseUnknown(String),

    #[error("Invalid license specification '{0}'")]
    LicenseSpecInvalid(String),

    // --- Cluster table errors ---
    #[error("Invalid partition name '{0}'")]
    InvalidPartitionName(String),

    #[error("Partition '{0}' already exists")]
    DuplicatePartition(String),

    #[error("Invalid node name '{0}'")]
    InvalidNodeName(String),

    #[error("Job {0} not found")]
    JobNotFound(u32),

    // --- Accounting agent errors ---
    #[error("Accounting agent queue is full")]
    AgentQueueFull,

    #[error("Accounting storage connection is down")]
    AgentConnectionDown,

    // --- Backup controller errors ---
    #[error("Operation not allowed in standby mode")]
    InStandbyMode,
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for LodestarError {
    fn clone(&self) -> Self {
        match self {
            LodestarError::Io(e) => LodestarError::Io(Arc::clone(e)),
            LodestarError::IoString(s) => LodestarError::IoString(s.clone()),
            LodestarError::InvalidRequest(s) => LodestarError::InvalidRequest(s.clone()),
            LodestarError::ConfigError(s) => LodestarError::ConfigError(s.clone()),
            LodestarError::Internal(s) => LodestarError::Internal(s.clone()),
            LodestarError::Protocol(s) => LodestarError::Protocol(s.clone()),
            LodestarError::StateFileCorrupt(s) => LodestarError::StateFileCorrupt(s.clone()),
            LodestarError::LockOrder(s) => LodestarError::LockOrder(s.clone()),
            LodestarError::NodesBusy => LodestarError::NodesBusy,
            LodestarError::NodeNotAvail => LodestarError::NodeNotAvail,
            LodestarError::RequestedNodeConfigUnavailable => {
                LodestarError::RequestedNodeConfigUnavailable
            }
            LodestarError::RequestedPartConfigUnavailable => {
                LodestarError::RequestedPartConfigUnavailable
            }
            LodestarError::ReservationBusy => LodestarError::ReservationBusy,
            LodestarError::ReservationMaint => LodestarError::ReservationMaint,
            LodestarError::ReservationNotUsable => LodestarError::ReservationNotUsable,
            LodestarError::LicensesUnavailable => LodestarError::LicensesUnavailable,
            LodestarError::AccountingPolicy => LodestarError::AccountingPolicy,
            LodestarError::InvalidQos => LodestarError::InvalidQos,
            LodestarError::InvalidAccount => LodestarError::InvalidAccount,
            LodestarError::BurstBufferWait => LodestarError::BurstBufferWait,
            LodestarError::MaxPoweredNodes => LodestarError::MaxPoweredNodes,
            LodestarError::JobHeld => LodestarError::JobHeld,
            LodestarError::InvalidNodeCount => LodestarError::InvalidNodeCount,
            LodestarError::LicenseUnknown(s) => LodestarError::LicenseUnknown(s.clone()),
            LodestarError::LicenseSpecInvalid(s) => LodestarError::LicenseSpecInvalid(s.clone()),
            LodestarError::InvalidPartitionName(s) => {
                LodestarError::InvalidPartitionName(s.clone())
            }
            LodestarError::DuplicatePartition(s) => LodestarError::DuplicatePartition(s.clone()),
            LodestarError::InvalidNodeName(s) => LodestarError::InvalidNodeName(s.clone()),
            LodestarError::JobNotFound(id) => LodestarError::JobNotFound(*id),
            LodestarError::AgentQueueFull => LodestarError::AgentQueueFull,
            LodestarError::AgentConnectionDown => LodestarError::AgentConnectionDown,
            LodestarError::InStandbyMode => LodestarError::InStandbyMode,
        }
    }
}

impl PartialEq for LodestarError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LodestarError::Io(e1), LodestarError::Io(e2)) => e1.to_string() == e2.to_string(),
            (LodestarError::IoString(s1), LodestarError::IoString(s2)) => s1 == s2,
            (LodestarError::InvalidRequest(s1), LodestarError::InvalidRequest(s2)) => s1 == s2,
            (LodestarError::ConfigError(s1), LodestarError::ConfigError(s2)) => s1 == s2,
            (LodestarError::Internal(s1), LodestarError::Internal(s2)) => s1 == s2,
            (LodestarError::Protocol(s1), LodestarError::Protocol(s2)) => s1 == s2,
            (LodestarError::StateFileCorrupt(s1), LodestarError::StateFileCorrupt(s2)) => s1 == s2,
            (LodestarError::LockOrder(s1), LodestarError::LockOrder(s2)) => s1 == s2,
            (LodestarError::LicenseUnknown(s1), LodestarError::LicenseUnknown(s2)) => s1 == s2,
            (LodestarError::LicenseSpecInvalid(s1), LodestarError::LicenseSpecInvalid(s2)) => {
                s1 == s2
            }
            (LodestarError::InvalidPartitionName(s1), LodestarError::InvalidPartitionName(s2)) => {
                s1 == s2
            }
            (LodestarError::DuplicatePartition(s1), LodestarError::DuplicatePartition(s2)) => {
                s1 == s2
            }
            (LodestarError::InvalidNodeName(s1), LodestarError::InvalidNodeName(s2)) => s1 == s2,
            (LodestarError::JobNotFound(id1), LodestarError::JobNotFound(id2)) => id1 == id2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for LodestarError {
    fn from(e: std::io::Error) -> Self {
        LodestarError::Io(Arc::new(e))
    }
}

impl From<String> for LodestarError {
    fn from(s: String) -> Self {
        LodestarError::IoString(s)
    }
}

impl From<ParseIntError> for LodestarError {
    fn from(e: ParseIntError) -> Self {
        LodestarError::InvalidRequest(format!("not a valid integer: {e}"))
    }
}

impl From<serde_json::Error> for LodestarError {
    fn from(e: serde_json::Error) -> Self {
        LodestarError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}
