// src/core/agent/persist.rs

//! Durable save/restore of the accounting queue.
//!
//! The state file is a framed stream: for each record a 4-byte length, the
//! record payload, then a fixed 32-bit magic. The first record is a version
//! string (`VER<n>`), so queues persisted by an older daemon can be
//! unpacked at their stored version and re-packed at the current one.
//! Registration messages are never persisted: replaying a registration from
//! a misconfigured cluster name can deadlock accounting.

use super::{CURRENT_RPC_VERSION, DbdMessage, DbdRpcType};
use crate::core::errors::LodestarError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;
use tracing::{info, warn};

const AGENT_STATE_MAGIC: u32 = 0xDEAD_3219;

/// Packs the queue into the framed stream.
pub fn pack_queue(msgs: &[DbdMessage]) -> Bytes {
    let mut buf = BytesMut::new();
    put_record(&mut buf, format!("VER{CURRENT_RPC_VERSION}").as_bytes());
    for msg in msgs {
        if msg.rpc_type == DbdRpcType::RegisterCtld {
            continue;
        }
        put_record(&mut buf, &msg.pack());
    }
    buf.freeze()
}

/// Unpacks the framed stream, up-converting older messages.
pub fn unpack_queue(mut data: Bytes) -> Result<Vec<DbdMessage>, LodestarError> {
    let version_rec = get_record(&mut data)?;
    let version_str = std::str::from_utf8(&version_rec)
        .map_err(|_| LodestarError::StateFileCorrupt("bad version record".into()))?;
    let stored_version: u16 = version_str
        .strip_prefix("VER")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            LodestarError::StateFileCorrupt(format!("bad version record '{version_str}'"))
        })?;
    if stored_version > CURRENT_RPC_VERSION {
        return Err(LodestarError::StateFileCorrupt(format!(
            "queue persisted at newer version {stored_version}"
        )));
    }

    let mut out = Vec::new();
    while data.has_remaining() {
        let rec = get_record(&mut data)?;
        // Unpack at the stored version, re-pack at the current one.
        let msg = DbdMessage::unpack(rec)?.upconvert();
        if msg.rpc_type == DbdRpcType::RegisterCtld {
            info!("Dropping persisted registration message");
            continue;
        }
        out.push(msg);
    }
    Ok(out)
}

/// Saves the queue to disk. Used at shutdown and by the overflow-exit path.
pub fn save_queue_sync(msgs: &[DbdMessage], path: &Path) -> Result<(), LodestarError> {
    let image = pack_queue(msgs);
    std::fs::write(path, &image)?;
    info!(
        "Persisted {} accounting message(s) to {}",
        msgs.iter()
            .filter(|m| m.rpc_type != DbdRpcType::RegisterCtld)
            .count(),
        path.display()
    );
    Ok(())
}

/// Loads a persisted queue. A missing file is an empty queue; a corrupt one
/// is surfaced so the caller can apply its ignore-state-errors policy.
pub fn load_queue(path: &Path) -> Result<Vec<DbdMessage>, LodestarError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No persisted accounting queue at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let msgs = unpack_queue(Bytes::from(bytes))?;
    if !msgs.is_empty() {
        warn!(
            "Restored {} unsent accounting message(s) from {}",
            msgs.len(),
            path.display()
        );
    }
    Ok(msgs)
}

fn put_record(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u32(AGENT_STATE_MAGIC);
}

fn get_record(data: &mut Bytes) -> Result<Bytes, LodestarError> {
    if data.remaining() < 4 {
        return Err(LodestarError::StateFileCorrupt("truncated record".into()));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len + 4 {
        return Err(LodestarError::StateFileCorrupt("truncated record".into()));
    }
    let payload = data.split_to(len);
    let magic = data.get_u32();
    if magic != AGENT_STATE_MAGIC {
        return Err(LodestarError::StateFileCorrupt(format!(
            "bad record magic {magic:#010x}"
        )));
    }
    Ok(payload)
}
