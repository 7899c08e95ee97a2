// src/server/spawner.rs

//! Spawns all of the controller's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use super::peer_listener;
use crate::core::agent::drain::{AgentDrain, TcpDbdTransport};
use crate::core::backup::{BackupManager, BackupOutcome, HeartbeatWriter};
use crate::core::power::PowerSaveManager;
use crate::core::power::script::ProcessScriptRunner;
use crate::core::state::save;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Interval between periodic partition-state saves.
const PART_SAVE_INTERVAL: Duration = Duration::from_secs(300);

/// Spawns all critical background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;
    let config = state.config.lock().await.clone();

    // --- Metrics server ---
    if config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Peer RPC listener ---
    let listener = peer_listener::PeerListener::new(
        state.clone(),
        config.controllers.clone(),
        ctx.shutdown_requested.clone(),
    );
    let shutdown_rx_listener = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        listener.run(shutdown_rx_listener).await;
        Ok(())
    });

    // --- Accounting agent drain ---
    if let Some(addr) = config.accounting.storage_addr.clone() {
        let transport = Arc::new(TcpDbdTransport::new(addr));
        let drain = AgentDrain::new(state.agent.clone(), transport);
        let shutdown_rx_drain = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            drain.run(shutdown_rx_drain).await;
            Ok(())
        });
    } else {
        info!("No accounting storage configured; the agent queue is inert.");
    }

    // --- Power save ---
    let (completion_tx, completion_rx) = mpsc::channel(64);
    let runner = Arc::new(ProcessScriptRunner::new(completion_tx));
    let power = PowerSaveManager::new(state.clone(), runner, completion_rx);
    let shutdown_rx_power = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        power.run(shutdown_rx_power).await;
        Ok(())
    });

    // --- Heartbeat writer (active only while primary) ---
    let writer = HeartbeatWriter::new(
        state.clone(),
        config.heartbeat_path(),
        config.heartbeat_interval,
    );
    let shutdown_rx_hb = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        writer.run(shutdown_rx_hb).await;
        Ok(())
    });

    // --- Backup election (standby instances only) ---
    if state.my_index > 0 {
        let backup = BackupManager::new(
            state.clone(),
            config.controllers.clone(),
            config.heartbeat_path(),
            config.controller_timeout,
            config.msg_timeout,
        );
        let shutdown_rx_backup = shutdown_tx.subscribe();
        let shutdown_requested = ctx.shutdown_requested.clone();
        background_tasks.spawn(async move {
            match backup.run(shutdown_rx_backup).await {
                BackupOutcome::TookOver => {
                    info!("Backup loop finished: now primary.");
                }
                BackupOutcome::ShutDown => {
                    shutdown_requested.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }
            Ok(())
        });
    }

    // --- Periodic partition-state saver ---
    let save_state = state.clone();
    let mut shutdown_rx_save = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        let mut interval = tokio::time::interval(PART_SAVE_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (image, path) = {
                        let path = save_state.config.lock().await.part_state_path();
                        let parts = save_state.parts.read();
                        (save::pack_part_state(&parts), path)
                    };
                    if let Err(e) = save::save_part_state(image, &path).await {
                        warn!("Periodic partition-state save failed: {e}");
                    }
                }
                _ = shutdown_rx_save.recv() => return Ok(()),
            }
        }
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
