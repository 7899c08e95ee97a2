// src/server/context.rs

//! The assembled runtime context handed from initialization to the spawner.

use crate::core::state::SharedState;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

pub struct ServerContext {
    pub state: Arc<SharedState>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    /// Set by an admin shutdown RPC; the main loop converts it into a
    /// broadcast on `shutdown_tx`.
    pub shutdown_requested: Arc<AtomicBool>,
}
