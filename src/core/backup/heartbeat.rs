// src/core/backup/heartbeat.rs

//! The heartbeat file: a small filesystem marker the primary refreshes once
//! per interval, used by backups as a liveness signal independent of the
//! network path.

use crate::core::errors::LodestarError;
use crate::core::state::SharedState;
use bytes::{Buf, BufMut, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Writes the heartbeat atomically: unix seconds plus the writer's
/// controller index.
pub fn write_heartbeat(path: &Path, index: u32) -> Result<(), LodestarError> {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_i64(chrono::Utc::now().timestamp());
    buf.put_u32(index);
    let tmp = path.with_extension("new");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads the heartbeat. `None` when the file is absent or malformed.
pub fn read_heartbeat(path: &Path) -> Option<(i64, u32)> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < 12 {
        return None;
    }
    let mut buf = &bytes[..];
    Some((buf.get_i64(), buf.get_u32()))
}

/// The primary's heartbeat-writer task.
pub struct HeartbeatWriter {
    state: Arc<SharedState>,
    path: PathBuf,
    interval: Duration,
}

impl HeartbeatWriter {
    pub fn new(state: Arc<SharedState>, path: PathBuf, interval: Duration) -> Self {
        Self {
            state,
            path,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Heartbeat writer started: {} every {:?}",
            self.path.display(),
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.state.is_primary.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = write_heartbeat(&self.path, self.state.my_index as u32) {
                        warn!("Could not write heartbeat file: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat writer shutting down.");
                    return;
                }
            }
        }
    }
}
