// src/core/backup/mod.rs

//! Backup controller election: heartbeat monitoring, peer pings, takeover,
//! and the standby-side RPC policy.

pub mod controller;
pub mod heartbeat;

use crate::core::protocol::{PeerRequest, PeerResponse};
use crate::core::state::SharedState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use controller::{BackupManager, BackupOutcome};
pub use heartbeat::HeartbeatWriter;

/// The standby RPC policy: a backup answers pings and status probes, honors
/// admin shutdown/takeover, and redirects configuration fetches to the
/// primary. Everything else is refused with the standby error.
pub fn handle_standby_request(
    state: &Arc<SharedState>,
    req: &PeerRequest,
    primary_addr: &str,
    takeover_flag: &AtomicBool,
    shutdown_flag: &AtomicBool,
) -> PeerResponse {
    match req {
        PeerRequest::Ping => PeerResponse::Ok,
        PeerRequest::ControlStatus => PeerResponse::ControlStatus {
            control_time: state.control_time.load(Ordering::SeqCst),
            backup_inx: state.my_index as u32,
        },
        PeerRequest::Shutdown => {
            shutdown_flag.store(true, Ordering::SeqCst);
            PeerResponse::Ok
        }
        PeerRequest::Takeover => {
            takeover_flag.store(true, Ordering::SeqCst);
            PeerResponse::Ok
        }
        PeerRequest::Config => PeerResponse::UsePrimary {
            addr: primary_addr.to_string(),
        },
        _ => PeerResponse::InStandby,
    }
}
