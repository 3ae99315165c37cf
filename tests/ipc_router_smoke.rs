
use serde_json::json;
use test_support::{request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn health_workspace_and_unknown_method() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health
        .get("workspacePath")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let workspace = temp_dir("attendanced-smoke");
    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected.get("workspacePath").and_then(|v| v.as_str()),
        Some(workspace.to_string_lossy().as_ref())
    );

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert!(health
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .is_some());

    let unknown = request(&mut stdin, &mut reader, "4", "nope.nothing", json!({}));
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );
}

#[test]
fn methods_require_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "subjects.list",
        json!({}),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("no_workspace")
    );
}
