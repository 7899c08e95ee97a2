// src/core/power/mod.rs

//! The power-save controller: suspends idle nodes and wakes nodes that
//! pending jobs need, paced by token buckets.

pub mod controller;
pub mod script;
pub mod tokens;

use crate::core::types::bitmap::NodeBitmap;

/// One job waiting for node power-up, queued by the allocation path and
/// consumed by the power-save loop.
#[derive(Clone, Debug)]
pub struct ResumeRequest {
    pub job_id: u32,
    /// Nodes of the job's allocation that still need waking.
    pub node_bitmap: NodeBitmap,
    pub features: Option<String>,
    pub extra: Option<String>,
}

pub use controller::PowerSaveManager;
pub use tokens::TokenBucket;
