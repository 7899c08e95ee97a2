// src/core/protocol/mod.rs

//! The controller peer protocol: length-delimited frames carrying JSON
//! request/response payloads between controller instances and node daemons.
//!
//! The wire format is deliberately simple; the contract is the message
//! semantics, not the byte layout.

use crate::core::errors::LodestarError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Requests a controller accepts from peers and admin tools.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    Ping,
    ControlStatus,
    /// Admin-issued: stop this instance.
    Shutdown,
    /// Admin-issued: take control now (backups only).
    Takeover,
    /// Peer-issued during failover: relinquish control.
    Control,
    /// Configuration fetch; backups redirect to the primary.
    Config,
    KillJob { job_id: u32 },
    TerminateJob { job_id: u32 },
    KillTimelimit { job_id: u32 },
    KillPreempted { job_id: u32 },
    LaunchProlog { job_id: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Ok,
    /// Status reply: when this instance took control (0 = standby) and its
    /// index in the controller list.
    ControlStatus { control_time: i64, backup_inx: u32 },
    /// Backups answer configuration fetches with the primary's address.
    UsePrimary { addr: String },
    InStandby,
    Error { message: String },
}

/// A one-request client connection to a peer controller.
pub struct PeerClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl PeerClient {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, LodestarError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LodestarError::IoString(format!("connect to {addr} timed out")))??;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    /// Sends one request and awaits its response, bounded by `timeout`.
    pub async fn request(
        &mut self,
        req: &PeerRequest,
        timeout: Duration,
    ) -> Result<PeerResponse, LodestarError> {
        let payload = serde_json::to_vec(req)?;
        tokio::time::timeout(timeout, self.framed.send(payload.into()))
            .await
            .map_err(|_| LodestarError::IoString("peer send timed out".into()))?
            .map_err(|e| LodestarError::IoString(format!("peer send failed: {e}")))?;

        let frame = tokio::time::timeout(timeout, self.framed.next())
            .await
            .map_err(|_| LodestarError::IoString("peer reply timed out".into()))?
            .ok_or_else(|| LodestarError::IoString("peer closed connection".into()))?
            .map_err(|e| LodestarError::IoString(format!("peer receive failed: {e}")))?;
        Ok(serde_json::from_slice(&frame)?)
    }
}

/// Reads one request from an accepted peer connection.
pub async fn read_request(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<Option<PeerRequest>, LodestarError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
        Some(Err(e)) => Err(LodestarError::IoString(format!("peer receive failed: {e}"))),
        None => Ok(None),
    }
}

/// Writes one response on an accepted peer connection.
pub async fn write_response(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    resp: &PeerResponse,
) -> Result<(), LodestarError> {
    let payload = serde_json::to_vec(resp)?;
    framed
        .send(payload.into())
        .await
        .map_err(|e| LodestarError::IoString(format!("peer send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_shape() {
        let req = PeerRequest::KillJob { job_id: 42 };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"kill_job","job_id":42}"#);
        let back: PeerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn control_status_round_trip() {
        let resp = PeerResponse::ControlStatus {
            control_time: 123,
            backup_inx: 1,
        };
        let back: PeerResponse =
            serde_json::from_slice(&serde_json::to_vec(&resp).unwrap()).unwrap();
        assert_eq!(back, resp);
    }
}
