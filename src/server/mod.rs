// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod initialization;
mod metrics_server;
mod peer_listener;
mod spawner;

pub use context::ServerContext;

/// The main controller startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize shared state and restore persisted data.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Run until a shutdown signal, then persist state.
    initialization::run_until_shutdown(server_context).await
}

/// Builds a detached log-filter handle for tools and tests that need a
/// `SharedState` without installing the global subscriber.
pub fn detached_log_handle() -> Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>> {
    let (_, handle) = reload::Layer::new(EnvFilter::new("info"));
    Arc::new(handle)
}
