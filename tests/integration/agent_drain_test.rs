// tests/integration/agent_drain_test.rs

use async_trait::async_trait;
use bytes::Bytes;
use lodestar::config::{AccountingConfig, MsgOverflowAction};
use lodestar::core::LodestarError;
use lodestar::core::agent::drain::{AgentDrain, DbdTransport};
use lodestar::core::agent::{AgentQueue, DbdMessage, DbdRpcType};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct MockTransport {
    batches: std::sync::Mutex<Vec<Vec<Bytes>>>,
    fail_once: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: std::sync::Mutex::new(Vec::new()),
            fail_once: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DbdTransport for MockTransport {
    async fn ensure_connected(&self) -> Result<(), LodestarError> {
        Ok(())
    }

    async fn exchange(&self, batch: Vec<Bytes>) -> Result<Vec<u32>, LodestarError> {
        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(LodestarError::AgentConnectionDown);
        }
        let n = batch.len();
        self.batches.lock().unwrap().push(batch);
        Ok(vec![0; n])
    }

    async fn disconnect(&self) {}
}

fn queue(max: usize) -> Arc<AgentQueue> {
    Arc::new(AgentQueue::new(
        AccountingConfig {
            storage_addr: Some("mock".into()),
            max_dbd_msgs: max,
            max_dbd_msg_action: MsgOverflowAction::Discard,
        },
        std::env::temp_dir().join("drain_test_dbd.messages"),
    ))
}

// Multiple waiting messages travel as one envelope, FIFO, and leave the
// queue only after the paired response arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_batches_fifo() {
    let q = queue(100);
    for i in 0..3 {
        q.send(DbdRpcType::JobStart, json!({"job_id": i})).unwrap();
    }

    let transport = MockTransport::new();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let drain = AgentDrain::new(q.clone(), transport.clone());
    let handle = tokio::spawn(drain.run(shutdown_tx.subscribe()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !q.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let batches = transport.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1, "three waiting messages ride one envelope");
    assert_eq!(batches[0].len(), 3);
    for (i, raw) in batches[0].iter().enumerate() {
        let msg = DbdMessage::unpack(raw.clone()).unwrap();
        assert_eq!(msg.payload, json!({"job_id": i}));
    }

    let _ = shutdown_tx.send(());
    q.set_shutdown();
    let _ = handle.await;
}

// A failed delivery leaves the queue intact for the retry.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_failure_keeps_messages() {
    let q = queue(100);
    q.send(DbdRpcType::JobComplete, json!({"job_id": 9})).unwrap();

    let transport = MockTransport::new();
    transport.fail_once.store(true, Ordering::SeqCst);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let drain = AgentDrain::new(q.clone(), transport.clone());
    let handle = tokio::spawn(drain.run(shutdown_tx.subscribe()));

    // Give the loop time to hit the failure; the message must survive it.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(q.len(), 1);
    assert!(transport.batches.lock().unwrap().is_empty());

    let _ = shutdown_tx.send(());
    q.set_shutdown();
    let _ = handle.await;
}

// An inline request travels ahead of the queue and releases the drain
// afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_inline_bypasses_queue() {
    let q = queue(100);
    q.send(DbdRpcType::JobStart, json!({"job_id": 1})).unwrap();

    let transport = MockTransport::new();
    let msg = DbdMessage::new(DbdRpcType::RegisterCtld, json!({"cluster": "c1"}));
    let rc = lodestar::core::agent::drain::send_inline(&q, transport.as_ref(), &msg)
        .await
        .unwrap();
    assert_eq!(rc, 0);
    assert!(!q.is_halted());

    let batches = transport.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    let sent = DbdMessage::unpack(batches[0][0].clone()).unwrap();
    assert_eq!(sent.rpc_type, DbdRpcType::RegisterCtld);
    // The queued message is untouched; only the drain loop delivers it.
    assert_eq!(q.len(), 1);
}

// An inline caller's halt pauses draining until cleared.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_halt_pauses_drain() {
    let q = queue(100);
    q.set_halt();
    q.send(DbdRpcType::JobStart, json!({"job_id": 1})).unwrap();

    let transport = MockTransport::new();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let drain = AgentDrain::new(q.clone(), transport.clone());
    let handle = tokio::spawn(drain.run(shutdown_tx.subscribe()));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(q.len(), 1, "halted agent must not drain");

    q.clear_halt();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !q.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(());
    q.set_shutdown();
    let _ = handle.await;
}
