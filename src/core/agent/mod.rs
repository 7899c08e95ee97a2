// src/core/agent/mod.rs

//! The accounting agent: a bounded outbound queue of RPCs to the accounting
//! database, with durable save/restore and a drain task.
//!
//! Delivery is at-least-once: messages leave the queue only after the
//! database acknowledged them, and the queue is persisted across restarts.
//! Registration messages are the one exception; a persisted registration
//! from a misconfigured cluster name can deadlock accounting on replay.

pub mod drain;
pub mod persist;

use crate::config::{AccountingConfig, MsgOverflowAction};
use crate::core::errors::LodestarError;
use crate::core::metrics;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::{error, warn};

/// Current envelope version; persisted queues at older versions are
/// up-converted on load.
pub const CURRENT_RPC_VERSION: u16 = 9;

/// Interval between half-full warnings.
const FULL_WARN_INTERVAL_SECS: i64 = 120;

/// RPC types understood by the accounting database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum DbdRpcType {
    RegisterCtld = 1401,
    ClusterTres = 1407,
    JobComplete = 1424,
    NodeStateUpdate = 1432,
    JobStart = 1433,
    StepComplete = 1441,
    StepStart = 1442,
}

impl DbdRpcType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1401 => Some(Self::RegisterCtld),
            1407 => Some(Self::ClusterTres),
            1424 => Some(Self::JobComplete),
            1432 => Some(Self::NodeStateUpdate),
            1433 => Some(Self::JobStart),
            1441 => Some(Self::StepComplete),
            1442 => Some(Self::StepStart),
            _ => None,
        }
    }

    /// Step records are the sacrificial class under queue pressure.
    pub fn is_step_record(&self) -> bool {
        matches!(self, Self::StepStart | Self::StepComplete)
    }
}

/// One queued outbound message: the packed buffer plus the metadata needed
/// to pair it with its response.
#[derive(Clone, Debug, PartialEq)]
pub struct DbdMessage {
    pub rpc_type: DbdRpcType,
    pub rpc_version: u16,
    pub payload: serde_json::Value,
}

impl DbdMessage {
    pub fn new(rpc_type: DbdRpcType, payload: serde_json::Value) -> Self {
        Self {
            rpc_type,
            rpc_version: CURRENT_RPC_VERSION,
            payload,
        }
    }

    /// Packs the message into its wire envelope.
    pub fn pack(&self) -> Bytes {
        let body = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(8 + body.len());
        buf.put_u16(self.rpc_version);
        buf.put_u16(self.rpc_type as u16);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Unpacks a wire envelope packed at any supported version.
    pub fn unpack(mut data: Bytes) -> Result<Self, LodestarError> {
        use bytes::Buf;
        if data.remaining() < 8 {
            return Err(LodestarError::StateFileCorrupt("short message".into()));
        }
        let rpc_version = data.get_u16();
        let rpc_type = DbdRpcType::from_u16(data.get_u16())
            .ok_or_else(|| LodestarError::StateFileCorrupt("unknown rpc type".into()))?;
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(LodestarError::StateFileCorrupt("short payload".into()));
        }
        let payload = serde_json::from_slice(&data.split_to(len))
            .map_err(|e| LodestarError::StateFileCorrupt(format!("bad payload: {e}")))?;
        Ok(Self {
            rpc_type,
            rpc_version,
            payload,
        })
    }

    /// Re-packs the message at the current version (the load-time
    /// up-conversion step).
    pub fn upconvert(mut self) -> Self {
        self.rpc_version = CURRENT_RPC_VERSION;
        self
    }
}

struct AgentInner {
    queue: VecDeque<DbdMessage>,
    /// Set by inline request/reply callers to pause bulk draining.
    halt: bool,
    shutdown: bool,
    last_full_warn: i64,
}

/// The bounded outbound queue. The mutex ranks after the cluster rails and
/// before the license mutex; no caller holds it across an await.
pub struct AgentQueue {
    inner: Mutex<AgentInner>,
    /// Wakes the drain loop when work arrives.
    pub drain_notify: Notify,
    /// Signalled when an inline caller clears the halt flag.
    pub halt_cleared: Notify,
    cfg: AccountingConfig,
    state_path: std::path::PathBuf,
    full_callback: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl std::fmt::Debug for AgentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentQueue")
            .field("len", &self.len())
            .field("max_dbd_msgs", &self.cfg.max_dbd_msgs)
            .finish()
    }
}

impl AgentQueue {
    pub fn new(cfg: AccountingConfig, state_path: std::path::PathBuf) -> Self {
        Self {
            inner: Mutex::new(AgentInner {
                queue: VecDeque::new(),
                halt: false,
                shutdown: false,
                last_full_warn: 0,
            }),
            drain_notify: Notify::new(),
            halt_cleared: Notify::new(),
            cfg,
            state_path,
            full_callback: Mutex::new(None),
        }
    }

    /// Registers a callback invoked when the queue crosses half capacity.
    pub fn set_full_callback(&self, cb: impl Fn(usize) + Send + Sync + 'static) {
        *self.full_callback.lock() = Some(Box::new(cb));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Enqueues one message, applying the overflow policy when full.
    pub fn send(&self, rpc_type: DbdRpcType, payload: serde_json::Value) -> Result<(), LodestarError> {
        let msg = DbdMessage::new(rpc_type, payload);
        let mut exit_requested = false;
        {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.cfg.max_dbd_msgs {
                // Step records go first; they are high-volume and the
                // accounting database can reconstruct steps from job records.
                let before = inner.queue.len();
                inner.queue.retain(|m| !m.rpc_type.is_step_record());
                let purged = before - inner.queue.len();
                if purged > 0 {
                    warn!(
                        "Accounting queue full ({before}); purged {purged} step records"
                    );
                    metrics::AGENT_MESSAGES_DROPPED_TOTAL.inc_by(purged as f64);
                }
            }
            if inner.queue.len() >= self.cfg.max_dbd_msgs {
                match self.cfg.max_dbd_msg_action {
                    MsgOverflowAction::Discard => {
                        metrics::AGENT_MESSAGES_DROPPED_TOTAL.inc();
                        warn!(
                            "Accounting queue full ({}); discarding {:?} message",
                            inner.queue.len(),
                            msg.rpc_type
                        );
                        return Err(LodestarError::AgentQueueFull);
                    }
                    MsgOverflowAction::Exit => {
                        inner.queue.push_back(msg.clone());
                        exit_requested = true;
                    }
                }
            } else {
                inner.queue.push_back(msg);
            }

            let len = inner.queue.len();
            metrics::AGENT_QUEUE_DEPTH.set(len as f64);
            if len >= self.cfg.max_dbd_msgs / 2 {
                let now = chrono::Utc::now().timestamp();
                if now - inner.last_full_warn >= FULL_WARN_INTERVAL_SECS {
                    inner.last_full_warn = now;
                    error!(
                        "Accounting queue is at {len} of {} messages; the \
                         accounting database is not keeping up",
                        self.cfg.max_dbd_msgs
                    );
                    if let Some(cb) = self.full_callback.lock().as_ref() {
                        cb(len);
                    }
                }
            }
        }

        if exit_requested {
            // Persist what we have, then terminate with a distinct status.
            error!(
                "Accounting queue overflow with action 'exit'; persisting queue and terminating"
            );
            let snapshot = self.snapshot();
            if let Err(e) = persist::save_queue_sync(&snapshot, &self.state_path) {
                error!("Could not persist accounting queue: {e}");
            }
            std::process::exit(3);
        }

        self.drain_notify.notify_one();
        Ok(())
    }

    /// Copies the queued messages, in order.
    pub fn snapshot(&self) -> Vec<DbdMessage> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Replaces the queue contents (restore path).
    pub fn restore(&self, msgs: Vec<DbdMessage>) {
        let mut inner = self.inner.lock();
        inner.queue = msgs.into();
        metrics::AGENT_QUEUE_DEPTH.set(inner.queue.len() as f64);
    }

    /// Takes up to `max_count` head messages whose packed sizes fit in
    /// `max_bytes`, leaving them queued until `commit` removes them.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Vec<DbdMessage> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for msg in inner.queue.iter().take(max_count) {
            let sz = msg.pack().len();
            if !out.is_empty() && bytes + sz > max_bytes {
                break;
            }
            bytes += sz;
            out.push(msg.clone());
        }
        out
    }

    /// Dequeues `n` delivered messages.
    pub fn commit(&self, n: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..n {
            inner.queue.pop_front();
        }
        metrics::AGENT_QUEUE_DEPTH.set(inner.queue.len() as f64);
    }

    pub fn is_halted(&self) -> bool {
        self.inner.lock().halt
    }

    /// Sets the halt flag; the drain loop pauses at its next check.
    pub fn set_halt(&self) {
        self.inner.lock().halt = true;
    }

    /// Clears the halt flag and releases a waiting drain loop. The stored
    /// permit from `notify_one` covers the race where the drain loop saw the
    /// flag but has not yet parked on the condition.
    pub fn clear_halt(&self) {
        self.inner.lock().halt = false;
        self.halt_cleared.notify_waiters();
        self.halt_cleared.notify_one();
    }

    pub fn set_shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.drain_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn state_path(&self) -> &std::path::Path {
        &self.state_path
    }
}
