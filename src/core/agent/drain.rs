// src/core/agent/drain.rs

//! The drain task: delivers queued accounting messages to the database.
//!
//! One message waiting goes out alone; more than one is packed into a
//! multi-message envelope (up to 1000 messages or `MAX_MSG_SIZE` bytes)
//! whose reply pairs every message with a response code. Failures leave
//! messages queued and back off ten seconds before reconnecting.

use super::{AgentQueue, DbdMessage};
use crate::core::errors::LodestarError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Largest envelope we will put on the wire.
pub const MAX_MSG_SIZE: usize = 16 * 1024 * 1024;
/// Largest number of messages in one envelope.
pub const MAX_BATCH_COUNT: usize = 1000;
/// Backoff after a connection or delivery failure.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// The transport seam to the accounting database. Batched sends return one
/// response code per message, in order.
#[async_trait]
pub trait DbdTransport: Send + Sync {
    async fn ensure_connected(&self) -> Result<(), LodestarError>;
    async fn exchange(&self, batch: Vec<Bytes>) -> Result<Vec<u32>, LodestarError>;
    async fn disconnect(&self);
}

/// TCP transport: length-delimited frames carrying packed messages. A batch
/// of more than one message is wrapped in a counted envelope.
pub struct TcpDbdTransport {
    addr: String,
    conn: Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>,
}

impl TcpDbdTransport {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DbdTransport for TcpDbdTransport {
    async fn ensure_connected(&self) -> Result<(), LodestarError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr).await?;
        info!("Connected to accounting storage at {}", self.addr);
        *conn = Some(Framed::new(
            stream,
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MSG_SIZE)
                .new_codec(),
        ));
        Ok(())
    }

    async fn exchange(&self, batch: Vec<Bytes>) -> Result<Vec<u32>, LodestarError> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or(LodestarError::AgentConnectionDown)?;

        let expected = batch.len();
        let envelope = pack_envelope(batch);
        if let Err(e) = conn.send(envelope).await {
            *guard = None;
            return Err(LodestarError::IoString(format!("send failed: {e}")));
        }
        match conn.next().await {
            Some(Ok(frame)) => {
                let codes = unpack_reply(frame.freeze())?;
                if codes.len() != expected {
                    return Err(LodestarError::Protocol(format!(
                        "reply paired {} of {expected} messages",
                        codes.len()
                    )));
                }
                Ok(codes)
            }
            Some(Err(e)) => {
                *guard = None;
                Err(LodestarError::IoString(format!("receive failed: {e}")))
            }
            None => {
                *guard = None;
                Err(LodestarError::AgentConnectionDown)
            }
        }
    }

    async fn disconnect(&self) {
        *self.conn.lock().await = None;
    }
}

/// Multi-message envelope: a count followed by length-prefixed messages.
fn pack_envelope(batch: Vec<Bytes>) -> Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::new();
    buf.put_u32(batch.len() as u32);
    for msg in batch {
        buf.put_u32(msg.len() as u32);
        buf.put_slice(&msg);
    }
    buf.freeze()
}

/// Reply envelope: one u32 response code per message.
fn unpack_reply(mut data: Bytes) -> Result<Vec<u32>, LodestarError> {
    use bytes::Buf;
    if data.remaining() < 4 {
        return Err(LodestarError::Protocol("short reply".into()));
    }
    let count = data.get_u32() as usize;
    if data.remaining() < count * 4 {
        return Err(LodestarError::Protocol("truncated reply".into()));
    }
    Ok((0..count).map(|_| data.get_u32()).collect())
}

/// Sends one message inline, ahead of the queue, for callers that need the
/// reply synchronously. The halt flag pauses the drain loop so the inline
/// exchange does not interleave with a bulk send; the flag is cleared and
/// the drain released whether or not the exchange succeeded.
pub async fn send_inline(
    queue: &AgentQueue,
    transport: &dyn DbdTransport,
    msg: &DbdMessage,
) -> Result<u32, LodestarError> {
    queue.set_halt();
    let result = async {
        transport.ensure_connected().await?;
        let codes = transport.exchange(vec![msg.pack()]).await?;
        codes
            .first()
            .copied()
            .ok_or_else(|| LodestarError::Protocol("empty inline reply".into()))
    }
    .await;
    queue.clear_halt();
    queue.drain_notify.notify_one();
    result
}

/// The drain loop task.
pub struct AgentDrain {
    queue: Arc<AgentQueue>,
    transport: Arc<dyn DbdTransport>,
}

impl AgentDrain {
    pub fn new(queue: Arc<AgentQueue>, transport: Arc<dyn DbdTransport>) -> Self {
        Self { queue, transport }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut last_failure: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = self.queue.drain_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.recv() => {
                    info!("Accounting drain shutting down.");
                    return;
                }
            }
            if self.queue.is_shutdown() {
                return;
            }

            // An inline request/reply caller owns the connection right now;
            // wait until it clears the halt flag.
            while self.queue.is_halted() {
                self.queue.halt_cleared.notified().await;
            }

            if self.queue.is_empty() {
                continue;
            }

            if let Some(at) = last_failure {
                if at.elapsed() < RECONNECT_BACKOFF {
                    continue;
                }
            }

            if let Err(e) = self.transport.ensure_connected().await {
                debug!("Accounting storage unreachable: {e}");
                last_failure = Some(tokio::time::Instant::now());
                continue;
            }

            let batch = self.queue.peek_batch(MAX_BATCH_COUNT, MAX_MSG_SIZE);
            if batch.is_empty() {
                continue;
            }
            let packed: Vec<Bytes> = batch.iter().map(DbdMessage::pack).collect();
            match self.transport.exchange(packed).await {
                Ok(codes) => {
                    for (msg, code) in batch.iter().zip(&codes) {
                        if *code != 0 {
                            warn!(
                                "Accounting storage rejected {:?}: rc={code}",
                                msg.rpc_type
                            );
                        }
                    }
                    self.queue.commit(batch.len());
                    crate::core::metrics::AGENT_MESSAGES_SENT_TOTAL.inc_by(batch.len() as f64);
                    last_failure = None;
                    debug!("Delivered {} accounting message(s)", batch.len());
                }
                Err(e) => {
                    warn!("Accounting delivery failed, will retry: {e}");
                    self.transport.disconnect().await;
                    last_failure = Some(tokio::time::Instant::now());
                }
            }
        }
    }
}
