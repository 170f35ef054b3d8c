use std::process::Command;

fn wardenctl(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_wardenctl"))
        .args(args)
        .output()
        .expect("failed to run wardenctl")
}

#[test]
fn version_prints_version() {
    let output = wardenctl(&["version"]);
    assert!(output.status.success(), "wardenctl version failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("wardenctl 0.1.0"),
        "expected version string in output: {stdout}"
    );
}

#[test]
fn unknown_state_is_rejected() {
    let output = wardenctl(&["--backend", "memory", "state", "alpha", "bogus"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("unrecognized state"),
        "expected state error in output: {stdout}"
    );
}

#[test]
fn unknown_backend_is_rejected() {
    let output = wardenctl(&["--backend", "carrier-pigeon", "info"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid backend"),
        "expected backend error in stderr: {stderr}"
    );
}

#[test]
fn missing_guest_maps_to_not_found_exit() {
    let output = wardenctl(&["--backend", "memory", "state", "ghost", "running"]);
    assert_eq!(output.status.code(), Some(4));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("guest not found"),
        "expected not-found error in output: {stdout}"
    );
}

#[test]
fn info_on_empty_registry_succeeds() {
    let output = wardenctl(&["--backend", "memory", "info"]);
    assert!(output.status.success());
    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("output is not JSON");
    assert_eq!(json["succeeded"], true);
    assert_eq!(json["changed"], false);
    assert_eq!(json["info"], serde_json::json!({}));
}

#[test]
fn set_without_value_is_rejected() {
    let output = wardenctl(&["--backend", "memory", "prefs", "alpha", "--set", "memory"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("KEY=VALUE"),
        "expected usage hint in stderr: {stderr}"
    );
}

#[test]
fn apply_reconciles_tasks_in_order() {
    // One process, one registry: the second ensure must be a no-op and the
    // state change must find the guest the first task created.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.yaml");
    std::fs::write(
        &path,
        "- name: alpha\n  command: create\n\
         - name: alpha\n  command: create\n\
         - name: alpha\n  state: running\n\
         - name: alpha\n  state: running\n",
    )
    .unwrap();

    let output = wardenctl(&["--backend", "memory", "apply", path.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let responses: Vec<serde_json::Value> =
        serde_json::from_slice(&output.stdout).expect("output is not a JSON array");
    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0]["changed"], true);
    assert_eq!(responses[1]["changed"], false);
    assert_eq!(responses[2]["changed"], true);
    assert_eq!(responses[3]["changed"], false);
}

#[test]
fn apply_preferences_task_reports_changed_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.yaml");
    std::fs::write(
        &path,
        "- name: alpha\n  preferences:\n    memory: 512\n    autostart: true\n",
    )
    .unwrap();

    let output = wardenctl(&["--backend", "memory", "apply", path.to_str().unwrap()]);
    assert!(output.status.success());
    let responses: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let detail = &responses[0]["detail"]["prefs_applied"];
    assert_eq!(detail["created"], true);
    assert_eq!(
        detail["fields"],
        serde_json::json!(["autostart", "memory"])
    );
}

#[test]
fn apply_rejects_a_malformed_task_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.yaml");
    std::fs::write(&path, "not: [valid").unwrap();

    let output = wardenctl(&["--backend", "memory", "apply", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid task file"),
        "expected parse error in stderr: {stderr}"
    );
}
