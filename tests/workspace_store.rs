use std::fs;

use ondemand_deployer::config::DeploymentMode;
use ondemand_deployer::workspace::{DeploymentMeta, DeploymentStatus, WorkspaceStore};
use tempfile::tempdir;

#[test]
fn allocate_creates_minimal_layout() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");
    assert!(ws.source_dir().is_dir());
    assert!(ws.logs_dir().is_dir());
    assert!(!ws.tf_dir().exists());
    assert!(!ws.manifests_dir().exists());
}

#[test]
fn allocate_twice_fails() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    store.allocate("app-1").expect("first allocate");
    let err = store.allocate("app-1").unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
}

#[test]
fn locate_finds_allocated_workspace() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let allocated = store.allocate("app-1").expect("allocate");
    let located = store.locate("app-1").expect("locate");
    assert_eq!(located.root(), allocated.root());
    assert!(store.locate("missing").is_err());
}

#[test]
fn release_refuses_while_state_marker_present() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");
    ws.mark_state_exists().expect("marker");

    let err = store.release("app-1", false).unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
    assert!(ws.root().exists());

    store.release("app-1", true).expect("forced release");
    assert!(!ws.root().exists());
}

#[test]
fn release_after_marker_cleared_succeeds() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");
    ws.mark_state_exists().expect("marker");
    ws.clear_state_marker().expect("clear");
    store.release("app-1", false).expect("release");
    assert!(!store.exists("app-1"));
}

#[test]
fn allocate_succeeds_again_after_release() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    store.allocate("app-1").expect("first");
    store.release("app-1", false).expect("release");
    store.allocate("app-1").expect("second allocate after release");
}

#[test]
fn meta_roundtrips_and_ignores_unknown_fields() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");

    let mut meta = DeploymentMeta::new("app-1", DeploymentMode::CloudHosted);
    meta.status = DeploymentStatus::Succeeded;
    meta.outputs
        .insert("public_ip".to_string(), "1.2.3.4".to_string());
    ws.save_meta(&meta).expect("save");

    let loaded = ws.load_meta().expect("load");
    assert_eq!(loaded.status, DeploymentStatus::Succeeded);
    assert_eq!(loaded.outputs.get("public_ip").unwrap(), "1.2.3.4");

    // A newer writer may add fields; this reader must keep working.
    let mut raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(ws.meta_path()).unwrap()).unwrap();
    raw["added_by_future_version"] = serde_json::json!({"nested": true});
    fs::write(ws.meta_path(), serde_json::to_string_pretty(&raw).unwrap()).unwrap();
    let reloaded = ws.load_meta().expect("load with unknown fields");
    assert_eq!(reloaded.id, "app-1");
    assert_eq!(reloaded.status, DeploymentStatus::Succeeded);
}

#[test]
fn list_returns_only_workspaces_with_meta() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");
    ws.save_meta(&DeploymentMeta::new("app-1", DeploymentMode::Local))
        .expect("save");
    store.allocate("app-2").expect("allocate without meta");
    fs::create_dir_all(base.path().join("stray-dir")).unwrap();

    assert_eq!(store.list().expect("list"), vec!["app-1".to_string()]);
}

#[test]
fn stage_logs_live_under_logs_dir() {
    let base = tempdir().expect("temp dir");
    let store = WorkspaceStore::new(base.path());
    let ws = store.allocate("app-1").expect("allocate");
    assert_eq!(ws.stage_log("build"), ws.logs_dir().join("build.log"));
}
