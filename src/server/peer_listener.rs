// src/server/peer_listener.rs

//! Accepts peer and admin RPCs on this controller's address.
//!
//! Primaries handle the full surface; standbys apply the restricted standby
//! policy (ping, status, admin shutdown/takeover, config redirect).

use crate::config::ControllerConfig;
use crate::core::backup::handle_standby_request;
use crate::core::protocol::{self, PeerRequest, PeerResponse};
use crate::core::sched::allocate::deallocate_nodes;
use crate::core::state::SharedState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

pub struct PeerListener {
    state: Arc<SharedState>,
    controllers: Vec<ControllerConfig>,
    shutdown_requested: Arc<AtomicBool>,
    takeover_requested: Arc<AtomicBool>,
}

impl PeerListener {
    pub fn new(
        state: Arc<SharedState>,
        controllers: Vec<ControllerConfig>,
        shutdown_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            controllers,
            shutdown_requested,
            takeover_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let addr = self.controllers[self.state.my_index].addr.clone();
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Cannot bind peer listener on {addr}: {e}");
                self.shutdown_requested.store(true, Ordering::SeqCst);
                return;
            }
        };
        info!("Peer RPC listener on {addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Peer connection from {peer}");
                            let state = self.state.clone();
                            let primary_addr = self.controllers[0].addr.clone();
                            let shutdown_flag = self.shutdown_requested.clone();
                            let takeover_flag = self.takeover_requested.clone();
                            tokio::spawn(async move {
                                let mut framed =
                                    Framed::new(stream, LengthDelimitedCodec::new());
                                while let Ok(Some(req)) =
                                    protocol::read_request(&mut framed).await
                                {
                                    let resp = dispatch(
                                        &state,
                                        &req,
                                        &primary_addr,
                                        &takeover_flag,
                                        &shutdown_flag,
                                    );
                                    if protocol::write_response(&mut framed, &resp)
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            });
                        }
                        Err(e) => warn!("Peer accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Peer listener shutting down.");
                    return;
                }
            }
        }
    }
}

fn dispatch(
    state: &Arc<SharedState>,
    req: &PeerRequest,
    primary_addr: &str,
    takeover_flag: &AtomicBool,
    shutdown_flag: &AtomicBool,
) -> PeerResponse {
    if !state.is_primary.load(Ordering::SeqCst) {
        return handle_standby_request(state, req, primary_addr, takeover_flag, shutdown_flag);
    }

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
        PeerRequest::Control => {
            // A backup is taking over; stop acting as primary and shut down.
            warn!("CONTROL received; relinquishing primary role.");
            state.is_primary.store(false, Ordering::SeqCst);
            shutdown_flag.store(true, Ordering::SeqCst);
            PeerResponse::Ok
        }
        PeerRequest::Takeover => PeerResponse::Ok,
        PeerRequest::Config => PeerResponse::Ok,
        PeerRequest::KillJob { job_id }
        | PeerRequest::TerminateJob { job_id }
        | PeerRequest::KillTimelimit { job_id }
        | PeerRequest::KillPreempted { job_id } => match deallocate_nodes(state, *job_id) {
            Ok(()) => PeerResponse::Ok,
            Err(e) => PeerResponse::Error {
                message: e.to_string(),
            },
        },
        PeerRequest::LaunchProlog { job_id } => {
            debug!("Prolog launch acknowledged for job {job_id}");
            PeerResponse::Ok
        }
    }
}
