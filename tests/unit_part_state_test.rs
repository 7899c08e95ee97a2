// tests/unit_part_state_test.rs

use lodestar::core::state::PartTable;
use lodestar::core::state::save::{
    load_part_state, pack_part_state, save_part_state, unpack_part_state,
};
use lodestar::core::types::bitmap::NodeBitmap;
use lodestar::core::types::partition::{Partition, SharePolicy};
use std::time::Duration;

fn table_with(names: &[&str]) -> PartTable {
    let mut table = PartTable::default();
    for (i, name) in names.iter().enumerate() {
        table
            .create(Partition {
                name: name.to_string(),
                index: 0,
                node_expr: format!("n[{}-{}]", i * 4 + 1, i * 4 + 4),
                node_bitmap: NodeBitmap::new(16),
                total_nodes: 4,
                total_cpus: 16,
                is_default: i == 0,
                state_up: true,
                min_nodes: 1,
                max_nodes: Some(4),
                max_time: Some(Duration::from_secs(3600)),
                default_time: None,
                priority_tier: i as u16,
                priority_job_factor: 1,
                preempt_mode: None,
                share: SharePolicy::Force(2),
                allow_accounts: vec!["physics".into()],
                deny_accounts: vec![],
                allow_qos: vec![],
                deny_qos: vec![],
                allow_groups: vec![],
                allow_alloc_nodes: vec![],
                qos: Some("normal".into()),
                billing_weights: vec![("cpu".into(), 1.0)],
                tres_cnt: vec![],
                exclusive_user: false,
                job_count: 0,
            })
            .unwrap();
    }
    table
}

#[test]
fn test_pack_unpack_round_trip() {
    let table = table_with(&["batch", "debug"]);
    let image = pack_part_state(&table);
    let (_ts, records) = unpack_part_state(image).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "batch");
    assert!(records[0].is_default);
    assert_eq!(records[0].share, "FORCE:2");
    assert_eq!(records[0].max_time_secs, Some(3600));
    assert_eq!(records[0].billing_weights, vec![("cpu".to_string(), 1.0)]);
    assert_eq!(records[1].name, "debug");
    assert_eq!(records[1].priority_tier, 1);
}

#[test]
fn test_unpack_rejects_garbage() {
    assert!(unpack_part_state(bytes::Bytes::from_static(b"nonsense")).is_err());
}

#[tokio::test]
async fn test_save_rotates_old_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part_state");

    let table = table_with(&["one"]);
    save_part_state(pack_part_state(&table), &path).await.unwrap();

    let table2 = table_with(&["one", "two"]);
    save_part_state(pack_part_state(&table2), &path).await.unwrap();

    let (_, records) = load_part_state(&path).await.unwrap();
    assert_eq!(records.len(), 2);

    // Corrupt the main file: the .old generation still loads.
    std::fs::write(&path, b"junk").unwrap();
    let (_, records) = load_part_state(&path).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "one");
}

#[tokio::test]
async fn test_load_missing_both_generations_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_part_state(&dir.path().join("part_state")).await.is_err());
}
