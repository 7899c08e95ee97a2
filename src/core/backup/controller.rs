// src/core/backup/controller.rs

//! The backup controller main loop: watch the primary over two independent
//! signals (network pings and the heartbeat file) and take over when both
//! go quiet for longer than the controller timeout.

use super::heartbeat::read_heartbeat;
use crate::config::ControllerConfig;
use crate::core::protocol::{PeerClient, PeerRequest, PeerResponse};
use crate::core::state::SharedState;
use crate::core::state::save;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Upper bound on the per-peer timeout used during takeover commands.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
/// Settle time after commanding peers, giving the old primary a chance to
/// persist its state before we load it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// Why the backup loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    /// This instance is now the primary.
    TookOver,
    /// Shutdown was requested while still in standby.
    ShutDown,
}

/// One ping round's view of a higher-priority peer.
#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub responding: bool,
    pub control_time: i64,
    pub last_seen: i64,
}

/// The standby-side controller task. Runs only when this instance's index
/// in the ordered controller list is above zero.
pub struct BackupManager {
    state: Arc<SharedState>,
    controllers: Vec<ControllerConfig>,
    heartbeat_path: PathBuf,
    controller_timeout: Duration,
    msg_timeout: Duration,
    /// Latest ping result per higher-priority peer index; written by the
    /// concurrent ping tasks and read by the decision step.
    pub peer_status: Arc<DashMap<u32, PeerStatus>>,
    /// Set by an admin TAKEOVER request; short-circuits the timeout check.
    pub takeover_requested: Arc<AtomicBool>,
}

impl BackupManager {
    pub fn new(
        state: Arc<SharedState>,
        controllers: Vec<ControllerConfig>,
        heartbeat_path: PathBuf,
        controller_timeout: Duration,
        msg_timeout: Duration,
    ) -> Self {
        Self {
            state,
            controllers,
            heartbeat_path,
            controller_timeout,
            msg_timeout,
            peer_status: Arc::new(DashMap::new()),
            takeover_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> BackupOutcome {
        let my_index = self.state.my_index as u32;
        info!(
            "Backup controller started (index {my_index}); watching {} for the primary.",
            self.heartbeat_path.display()
        );

        // Step 1: the heartbeat file must exist before standby monitoring
        // makes sense; a cluster that never started a primary has nothing to
        // take over from.
        loop {
            if read_heartbeat(&self.heartbeat_path).is_some() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.recv() => return BackupOutcome::ShutDown,
            }
        }
        info!("Heartbeat file found; entering standby monitoring.");

        let ping_interval = (self.controller_timeout / 3).max(Duration::from_secs(1));
        let mut last_ping = tokio::time::Instant::now() - ping_interval;
        let mut prev_heartbeat: Option<i64> = None;
        let mut first_iteration = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.recv() => return BackupOutcome::ShutDown,
            }

            if last_ping.elapsed() >= ping_interval {
                last_ping = tokio::time::Instant::now();
                self.ping_higher_peers(my_index).await;
                let primary_alive = self
                    .peer_status
                    .iter()
                    .any(|s| s.responding && s.control_time > 0);
                if primary_alive {
                    self.state
                        .last_controller_response
                        .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
                }
            }

            let now = chrono::Utc::now().timestamp();
            let heartbeat = read_heartbeat(&self.heartbeat_path);
            let last_net = self.state.last_controller_response.load(Ordering::SeqCst);

            // Admin takeover bypasses the timeout as long as a heartbeat
            // file exists at all.
            if self.takeover_requested.load(Ordering::SeqCst) && heartbeat.is_some() {
                info!("Administrative takeover requested.");
                self.take_over(my_index).await;
                return BackupOutcome::TookOver;
            }

            let recently_responded =
                last_net > 0 && now - last_net <= self.controller_timeout.as_secs() as i64;
            if recently_responded {
                if let Some((hb_ts, _)) = heartbeat {
                    prev_heartbeat = Some(hb_ts);
                }
                first_iteration = false;
                continue;
            }

            // A lower-priority peer holding control means a takeover already
            // happened past us; stay passive.
            if let Some((_, server_inx)) = heartbeat {
                if server_inx > my_index {
                    debug!("Lower-priority controller {server_inx} is primary; staying passive.");
                    first_iteration = false;
                    continue;
                }
            }

            match heartbeat {
                None => {
                    warn!("Heartbeat file disappeared; aborting takeover evaluation.");
                    prev_heartbeat = None;
                    first_iteration = false;
                    continue;
                }
                Some((hb_ts, _)) => {
                    // Filesystem newer than the network path: the primary is
                    // alive but unreachable to us. Trust the filesystem and
                    // re-arm the sentinel.
                    if hb_ts > last_net && prev_heartbeat != Some(hb_ts) {
                        debug!(
                            "Heartbeat advancing ({hb_ts}) while network is quiet; trusting filesystem."
                        );
                        prev_heartbeat = Some(hb_ts);
                        first_iteration = false;
                        continue;
                    }
                    if first_iteration {
                        debug!("First standby iteration; arming heartbeat sentinel.");
                        prev_heartbeat = Some(hb_ts);
                        first_iteration = false;
                        continue;
                    }
                    if prev_heartbeat != Some(hb_ts) {
                        debug!("Heartbeat still advancing; aborting takeover evaluation.");
                        prev_heartbeat = Some(hb_ts);
                        continue;
                    }

                    let use_time = last_net.max(hb_ts);
                    if now - use_time > self.controller_timeout.as_secs() as i64 {
                        warn!(
                            "No primary evidence for {}s (timeout {}s); taking over.",
                            now - use_time,
                            self.controller_timeout.as_secs()
                        );
                        break;
                    }
                }
            }
        }

        self.take_over(my_index).await;
        BackupOutcome::TookOver
    }

    /// Pings every higher-priority peer in parallel, one task per peer.
    /// All results land in `peer_status` and are joined before any decision.
    async fn ping_higher_peers(&self, my_index: u32) {
        let mut tasks = JoinSet::new();
        for (idx, peer) in self.controllers.iter().enumerate() {
            if idx as u32 >= my_index {
                continue;
            }
            let addr = peer.addr.clone();
            let timeout = self.msg_timeout;
            let expect_index = idx as u32;
            let statuses = self.peer_status.clone();
            tasks.spawn(async move {
                let now = chrono::Utc::now().timestamp();
                let status = match ping_peer(&addr, timeout).await {
                    Some((control_time, backup_inx)) => {
                        if backup_inx != expect_index {
                            warn!(
                                "Peer {addr} reports index {backup_inx}, expected {expect_index}"
                            );
                        }
                        PeerStatus {
                            responding: true,
                            control_time,
                            last_seen: now,
                        }
                    }
                    None => {
                        debug!("Controller {expect_index} ({addr}) is not responding");
                        PeerStatus {
                            responding: false,
                            control_time: 0,
                            last_seen: now,
                        }
                    }
                };
                statuses.insert(expect_index, status);
            });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Peer ping task panicked: {e}");
            }
        }
    }

    /// The takeover sequence: command the peers, give the old primary time
    /// to persist, then run primary initialization.
    async fn take_over(&self, my_index: u32) {
        let cmd_timeout = CONTROL_TIMEOUT.min(self.msg_timeout / 2);
        let mut tasks = JoinSet::new();

        for (idx, peer) in self.controllers.iter().enumerate() {
            let idx = idx as u32;
            if idx == my_index {
                continue;
            }
            // Lower-priority peers shut down; higher-priority peers that are
            // not primary relinquish control.
            let req = if idx > my_index {
                PeerRequest::Shutdown
            } else {
                PeerRequest::Control
            };
            let addr = peer.addr.clone();
            tasks.spawn(async move {
                match PeerClient::connect(&addr, cmd_timeout).await {
                    Ok(mut client) => match client.request(&req, cmd_timeout).await {
                        Ok(resp) => debug!("Peer {addr} answered {req:?}: {resp:?}"),
                        Err(e) => debug!("Peer {addr} did not answer {req:?}: {e}"),
                    },
                    Err(e) => debug!("Peer {addr} unreachable for {req:?}: {e}"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        info!(
            "Waiting {}s for the previous primary to persist state.",
            SHUTDOWN_WAIT.as_secs()
        );
        tokio::time::sleep(SHUTDOWN_WAIT).await;

        self.primary_init().await;
    }

    /// Primary initialization after takeover: restore persisted state,
    /// restart the accounting agent, and refresh every node's runtime info.
    async fn primary_init(&self) {
        let now = chrono::Utc::now().timestamp();

        // Restore the partition table written by the previous primary.
        let (part_path, ignore_errors) = {
            let config = self.state.config.lock().await;
            (config.part_state_path(), config.ignore_state_errors)
        };
        match save::load_part_state(&part_path).await {
            Ok((saved_at, records)) => {
                info!(
                    "Restoring partition state from {} (saved at {saved_at}).",
                    part_path.display()
                );
                let mut parts = self.state.parts.write();
                save::apply_part_records(&mut parts, records);
            }
            Err(crate::core::LodestarError::Io(io))
                if io.kind() == std::io::ErrorKind::NotFound =>
            {
                info!("No partition state to restore; continuing from configuration.");
            }
            Err(e) if ignore_errors => {
                warn!("Ignoring unreadable partition state: {e}");
            }
            Err(e) => {
                // A corrupt state file on takeover is fatal by policy; the
                // operator opted out of that with ignore_state_errors.
                error!("Cannot restore partition state during takeover: {e}");
                std::process::exit(2);
            }
        }

        // Restore the accounting queue and wake the drain task.
        match crate::core::agent::persist::load_queue(self.state.agent.state_path()) {
            Ok(msgs) if !msgs.is_empty() => {
                self.state.agent.restore(msgs);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not restore accounting queue: {e}"),
        }
        self.state.agent.drain_notify.notify_one();

        // Refresh node-derived state wholesale.
        {
            let mut nodes = self.state.nodes.write();
            nodes.rebuild_bitmaps();
        }

        self.state.is_primary.store(true, Ordering::SeqCst);
        self.state.control_time.store(now, Ordering::SeqCst);
        info!("Takeover complete; this instance is now the primary controller.");
    }
}

async fn ping_peer(addr: &str, timeout: Duration) -> Option<(i64, u32)> {
    let mut client = PeerClient::connect(addr, timeout).await.ok()?;
    match client.request(&PeerRequest::ControlStatus, timeout).await {
        Ok(PeerResponse::ControlStatus {
            control_time,
            backup_inx,
        }) => Some((control_time, backup_inx)),
        Ok(other) => {
            debug!("Peer {addr} answered control status with {other:?}");
            None
        }
        Err(_) => None,
    }
}
