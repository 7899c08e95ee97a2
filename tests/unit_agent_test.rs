// tests/unit_agent_test.rs

use lodestar::config::{AccountingConfig, MsgOverflowAction};
use lodestar::core::agent::persist::{load_queue, save_queue_sync};
use lodestar::core::agent::{AgentQueue, DbdMessage, DbdRpcType};
use serde_json::json;

fn queue_with_max(max: usize) -> AgentQueue {
    AgentQueue::new(
        AccountingConfig {
            storage_addr: None,
            max_dbd_msgs: max,
            max_dbd_msg_action: MsgOverflowAction::Discard,
        },
        std::env::temp_dir().join("unused_dbd.messages"),
    )
}

#[test]
fn test_enqueue_and_order() {
    let queue = queue_with_max(10);
    queue.send(DbdRpcType::JobStart, json!({"job_id": 1})).unwrap();
    queue.send(DbdRpcType::JobComplete, json!({"job_id": 1})).unwrap();
    let batch = queue.peek_batch(10, usize::MAX);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].rpc_type, DbdRpcType::JobStart);
    assert_eq!(batch[1].rpc_type, DbdRpcType::JobComplete);
    queue.commit(1);
    assert_eq!(queue.len(), 1);
}

// Overflow with discard: step records are purged first, and the freed slots
// take the new messages.
#[test]
fn test_overflow_purges_step_records_first() {
    let queue = queue_with_max(6);
    for i in 0..3 {
        queue.send(DbdRpcType::JobStart, json!({"job_id": i})).unwrap();
    }
    for i in 0..2 {
        queue.send(DbdRpcType::StepStart, json!({"step": i})).unwrap();
    }
    assert_eq!(queue.len(), 5);

    // Fits: queue reaches its bound.
    queue.send(DbdRpcType::StepStart, json!({"step": 2})).unwrap();
    assert_eq!(queue.len(), 6);

    // Full now: the purge drops all three step records, then this one lands.
    queue.send(DbdRpcType::StepStart, json!({"step": 3})).unwrap();
    let remaining = queue.snapshot();
    assert_eq!(remaining.len(), 4);
    assert_eq!(
        remaining
            .iter()
            .filter(|m| m.rpc_type == DbdRpcType::JobStart)
            .count(),
        3
    );
    assert_eq!(
        remaining
            .iter()
            .filter(|m| m.rpc_type == DbdRpcType::StepStart)
            .count(),
        1
    );
}

#[test]
fn test_overflow_discards_when_nothing_purgeable() {
    let queue = queue_with_max(2);
    queue.send(DbdRpcType::JobStart, json!({"job_id": 1})).unwrap();
    queue.send(DbdRpcType::JobStart, json!({"job_id": 2})).unwrap();
    let err = queue
        .send(DbdRpcType::JobStart, json!({"job_id": 3}))
        .unwrap_err();
    assert_eq!(err, lodestar::core::LodestarError::AgentQueueFull);
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_persist_round_trip_skips_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbd.messages");

    let msgs = vec![
        DbdMessage::new(DbdRpcType::RegisterCtld, json!({"cluster": "c1"})),
        DbdMessage::new(DbdRpcType::JobStart, json!({"job_id": 7})),
        DbdMessage::new(DbdRpcType::NodeStateUpdate, json!({"node": "n1"})),
    ];
    save_queue_sync(&msgs, &path).unwrap();

    let restored = load_queue(&path).unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].rpc_type, DbdRpcType::JobStart);
    assert_eq!(restored[0].payload, json!({"job_id": 7}));
    assert_eq!(restored[1].rpc_type, DbdRpcType::NodeStateUpdate);
}

#[test]
fn test_load_missing_file_is_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let restored = load_queue(&dir.path().join("absent")).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn test_load_rejects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbd.messages");
    let msgs = vec![DbdMessage::new(DbdRpcType::JobStart, json!({}))];
    save_queue_sync(&msgs, &path).unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();
    assert!(load_queue(&path).is_err());
}

#[test]
fn test_halt_flag_protocol() {
    let queue = queue_with_max(4);
    assert!(!queue.is_halted());
    queue.set_halt();
    assert!(queue.is_halted());
    queue.clear_halt();
    assert!(!queue.is_halted());
}
