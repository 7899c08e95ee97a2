// src/server/initialization.rs

//! Controller initialization: state construction, persisted-state restore,
//! and the shutdown path that persists everything back.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::agent::persist as agent_persist;
use crate::core::state::{SharedState, save};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all components before the task spawner runs.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    info!(
        "Lodestar {VERSION} starting: cluster '{}', {} controller(s) configured.",
        config.cluster_name,
        config.controllers.len()
    );

    std::fs::create_dir_all(&config.state_save_location).with_context(|| {
        format!(
            "cannot create state directory '{}'",
            config.state_save_location
        )
    })?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let ignore_state_errors = config.ignore_state_errors;
    let part_path = config.part_state_path();
    let dbd_path = config.dbd_messages_path();

    let init = SharedState::initialize(config, log_reload_handle)?;
    let state = init.state;

    if state.my_index == 0 {
        info!("This instance is the primary controller.");
    } else {
        info!(
            "This instance is backup controller {} and starts in standby.",
            state.my_index
        );
    }

    // Restore the partition table.
    match save::load_part_state(&part_path).await {
        Ok((saved_at, records)) => {
            info!(
                "Restoring partition state saved at {saved_at} from {}.",
                part_path.display()
            );
            let mut parts = state.parts.write();
            save::apply_part_records(&mut parts, records);
        }
        Err(e) => {
            let missing = matches!(
                &e,
                crate::core::LodestarError::Io(io) if io.kind() == std::io::ErrorKind::NotFound
            );
            if missing {
                info!("No partition state file; starting from configuration.");
            } else if ignore_state_errors {
                warn!("Ignoring unreadable partition state: {e}");
            } else {
                // Corrupt state without the ignore flag is fatal by policy.
                return Err(anyhow::anyhow!("corrupt partition state file: {e}"));
            }
        }
    }

    // Restore the accounting queue.
    match agent_persist::load_queue(&dbd_path) {
        Ok(msgs) if !msgs.is_empty() => state.agent.restore(msgs),
        Ok(_) => {}
        Err(e) if ignore_state_errors => warn!("Ignoring unreadable accounting queue: {e}"),
        Err(e) => return Err(anyhow::anyhow!("corrupt accounting queue file: {e}")),
    }

    Ok(ServerContext {
        state,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        shutdown_requested: Arc::new(AtomicBool::new(false)),
    })
}

/// Runs until SIGINT/SIGTERM or an admin shutdown request, then persists
/// state and stops every background task.
pub async fn run_until_shutdown(mut ctx: ServerContext) -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received; shutting down.");
                break;
            }
            _ = term.recv() => {
                info!("SIGTERM received; shutting down.");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if ctx.shutdown_requested.load(Ordering::SeqCst) {
                    info!("Shutdown requested by peer or admin; shutting down.");
                    break;
                }
            }
        }
    }

    let _ = ctx.shutdown_tx.send(());
    ctx.state.agent.set_shutdown();

    // Persist pending work before the tasks unwind.
    persist_all(&ctx.state).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while let Ok(Some(res)) =
        tokio::time::timeout_at(deadline, ctx.background_tasks.join_next()).await
    {
        if let Err(e) = res {
            error!("Background task ended abnormally: {e}");
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Persists the partition table and the accounting queue.
pub async fn persist_all(state: &Arc<SharedState>) {
    let (part_path, dbd_path) = {
        let config = state.config.lock().await;
        (config.part_state_path(), config.dbd_messages_path())
    };

    let image = {
        let parts = state.parts.read();
        save::pack_part_state(&parts)
    };
    if let Err(e) = save::save_part_state(image, &part_path).await {
        error!("Could not save partition state: {e}");
    }

    let snapshot = state.agent.snapshot();
    if let Err(e) = agent_persist::save_queue_sync(&snapshot, &dbd_path) {
        error!("Could not save accounting queue: {e}");
    }
}
