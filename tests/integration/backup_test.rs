// tests/integration/backup_test.rs

use super::test_helpers::*;
use lodestar::config::ControllerConfig;
use lodestar::core::backup::heartbeat::{read_heartbeat, write_heartbeat};
use lodestar::core::backup::BackupManager;
use std::sync::atomic::Ordering;
use std::time::Duration;

// The takeover scenario: the primary's heartbeat stops advancing and no
// peer answers pings. After the controller timeout the backup commands its
// peers, waits out the settle period, and becomes primary.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backup_takes_over_after_stale_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = default_cluster(dir.path());
    config.controllers = vec![
        ControllerConfig {
            hostname: "primary".into(),
            // Nothing listens here; pings fail fast.
            addr: "127.0.0.1:17901".into(),
        },
        ControllerConfig {
            hostname: "backup".into(),
            addr: "127.0.0.1:17902".into(),
        },
    ];
    config.this_hostname = Some("backup".into());
    config.controller_timeout = Duration::from_secs(2);
    config.msg_timeout = Duration::from_secs(1);

    let heartbeat_path = config.heartbeat_path();
    let controller_timeout = config.controller_timeout;
    let msg_timeout = config.msg_timeout;
    let controllers = config.controllers.clone();
    let state = build_state(config);
    assert_eq!(state.my_index, 1);
    assert!(!state.is_primary.load(Ordering::SeqCst));

    // A primary existed once: it wrote the heartbeat, then died.
    write_heartbeat(&heartbeat_path, 0).unwrap();
    let (hb_ts, hb_idx) = read_heartbeat(&heartbeat_path).unwrap();
    assert_eq!(hb_idx, 0);
    assert!(hb_ts > 0);

    let manager = BackupManager::new(
        state.clone(),
        controllers,
        heartbeat_path,
        controller_timeout,
        msg_timeout,
    );
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(manager.run(shutdown_tx.subscribe()));

    // Takeover needs: one iteration to arm the sentinel, the timeout to
    // expire, the peer commands to fail fast, and the 2s settle sleep.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !state.is_primary.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "backup never took over"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    assert!(state.control_time.load(Ordering::SeqCst) > 0);
    let outcome = handle.await.unwrap();
    assert_eq!(outcome, lodestar::core::backup::BackupOutcome::TookOver);
}

// While the heartbeat keeps advancing, the backup must stay passive even if
// the network path is quiet.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backup_trusts_advancing_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = default_cluster(dir.path());
    config.controllers = vec![
        ControllerConfig {
            hostname: "primary".into(),
            addr: "127.0.0.1:17903".into(),
        },
        ControllerConfig {
            hostname: "backup".into(),
            addr: "127.0.0.1:17904".into(),
        },
    ];
    config.this_hostname = Some("backup".into());
    config.controller_timeout = Duration::from_secs(2);
    config.msg_timeout = Duration::from_secs(1);

    let heartbeat_path = config.heartbeat_path();
    let controllers = config.controllers.clone();
    let controller_timeout = config.controller_timeout;
    let msg_timeout = config.msg_timeout;
    let state = build_state(config);

    write_heartbeat(&heartbeat_path, 0).unwrap();

    let manager = BackupManager::new(
        state.clone(),
        controllers,
        heartbeat_path.clone(),
        controller_timeout,
        msg_timeout,
    );
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(manager.run(shutdown_tx.subscribe()));

    // Keep the heartbeat fresh for six seconds, three timeouts' worth.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        write_heartbeat(&heartbeat_path, 0).unwrap();
        assert!(
            !state.is_primary.load(Ordering::SeqCst),
            "backup must not take over while the heartbeat advances"
        );
    }

    let _ = shutdown_tx.send(());
    let outcome = handle.await.unwrap();
    assert_eq!(outcome, lodestar::core::backup::BackupOutcome::ShutDown);
}
