// tests/unit_config_test.rs

use lodestar::config::Config;

fn write_config(dir: &std::path::Path, body: &str) -> String {
    let path = dir.join("lodestar.toml");
    std::fs::write(&path, body).unwrap();
    path.display().to_string()
}

const BASE: &str = r#"
cluster_name = "testcluster"

[[controllers]]
hostname = "ctl1"
addr = "127.0.0.1:7817"

[[nodes]]
names = "n[1-4]"
cpus = 4
real_memory = 1024

[[partitions]]
name = "batch"
nodes = "n[1-4]"
default = true
"#;

#[test]
fn test_minimal_config_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BASE);
    let cfg = Config::from_file(&path).unwrap();
    assert_eq!(cfg.cluster_name, "testcluster");
    assert_eq!(cfg.partitions.len(), 1);
    assert_eq!(cfg.accounting.max_dbd_msgs, 10_000);
    assert_eq!(cfg.power_save.suspend_rate, 60);
}

#[test]
fn test_gang_partition_override_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{BASE}preempt_mode = \"gang\"\n");
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_bad_share_policy_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = BASE.replace("default = true", "default = true\nmax_share = \"MAYBE\"");
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_two_default_partitions_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{BASE}
[[partitions]]
name = \"debug\"
nodes = \"n[1-2]\"
default = true
"
    );
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_relative_power_program_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{BASE}
[power_save]
suspend_program = \"bin/suspend.sh\"
resume_program = \"/usr/bin/resume.sh\"
"
    );
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_unknown_exclusion_state_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{BASE}
[power_save]
suspend_program = \"/usr/bin/suspend.sh\"
resume_program = \"/usr/bin/resume.sh\"
suspend_exc_states = [\"DOWN\", \"SPARKLY\"]
"
    );
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_bad_license_spec_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{BASE}licenses = \"matlab:nope\"\n");
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_zero_max_dbd_msgs_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{BASE}
[accounting]
max_dbd_msgs = 0
"
    );
    let path = write_config(dir.path(), &body);
    assert!(Config::from_file(&path).is_err());
}
