// src/core/types/mod.rs

pub mod bitmap;
pub mod hostlist;
pub mod job;
pub mod node;
pub mod partition;
pub mod reservation;

pub use bitmap::NodeBitmap;
pub use job::{Job, JobState, StateReason};
pub use node::{BaseState, Node, NodeFlags, NodeState};
pub use partition::{Partition, SharePolicy};
pub use reservation::{Reservation, ResvFlags};
