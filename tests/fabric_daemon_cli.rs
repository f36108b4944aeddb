use std::fs;
use std::process::Command;

use serde_json::json;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let storage = dir.join("recovery");
    let config = json!({
        "logging": {"level": "warn"},
        "thread_pool": {"min_threads": 1, "max_threads": 2, "queue_size": 64},
        "load_balancer": {
            "strategy": "hybrid_adaptive",
            "resource_weights": {"cpu": 0.3, "memory": 0.25, "network": 0.25, "energy": 0.2}
        },
        "kernels": {
            "core": {"count": 2, "id_prefix": "core"},
            "micro": {"count": 1, "id_prefix": "micro"}
        },
        "cache": {"dynamic": {"initial_size": 32, "max_size": 256}},
        "recovery": {
            "max_recovery_points": 4,
            "compression": true,
            "storage_path": storage.to_string_lossy()
        },
        "preload": {"max_queue_size": 32},
        "preload_seed": [
            {"key": "warm_a", "data": "alpha"},
            {"key": "warm_b", "data": "beta"}
        ],
        "tasks": [
            {"data": "high priority compute", "priority": 9, "class": "cpu_intensive"},
            {"data": "bulk io", "priority": 2, "class": "io_intensive"},
            {"data": "routine", "priority": 5}
        ]
    });

    let path = dir.join("fabric_config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).expect("write config");
    path
}

#[test]
fn daemon_runs_from_config_and_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_config(dir.path());
    let report_path = dir.path().join("report.json");

    let exe = env!("CARGO_BIN_EXE_fabric_daemon");
    let output = Command::new(exe)
        .arg(&config_path)
        .arg(&report_path)
        .output()
        .expect("run fabric daemon");

    assert!(output.status.success(), "daemon failed: {output:?}");
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(stdout.contains("Fabric daemon summary:"));
    assert!(stdout.contains("tasks dispatched: 3"));
    assert!(stdout.contains("strategy: hybrid_adaptive"));
    assert!(stdout.contains("recovery point: "));
    assert!(!stdout.contains("recovery point: none"));

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(&report_path).expect("read report")).expect("parse report");
    assert_eq!(report["dispatched"], 3);
    assert_eq!(report["kernels"].as_array().unwrap().len(), 3);
    let processed: u64 = report["kernels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|kernel| kernel["processed"].as_u64().unwrap())
        .sum();
    assert_eq!(processed, 3, "every dispatched task was processed");

    // One recovery point persisted with the configured compression.
    let point_id = report["recovery_point"].as_str().expect("point id");
    let point_file = dir.path().join("recovery").join(format!("{point_id}.json"));
    let record: serde_json::Value =
        serde_json::from_slice(&fs::read(point_file).expect("read point")).expect("parse point");
    assert_eq!(record["compressed"], true);
    assert_eq!(record["id"], *point_id);
}

#[test]
fn daemon_rejects_invalid_configuration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.json");
    fs::write(
        &path,
        r#"{"cache": {"dynamic": {"eviction_policy": "mru"}}}"#,
    )
    .expect("write config");

    let exe = env!("CARGO_BIN_EXE_fabric_daemon");
    let output = Command::new(exe).arg(&path).output().expect("run daemon");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr utf8");
    assert!(stderr.contains("eviction_policy"));
}
