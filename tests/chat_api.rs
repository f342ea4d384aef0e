use std::net::SocketAddr;
use std::sync::Arc;

use ondemand_deployer::config::{DeploymentMode, OrchestratorConfig, StageTimeouts};
use ondemand_deployer::iac::IacTool;
use ondemand_deployer::pipeline::Orchestrator;
use ondemand_deployer::server::{self, AppState, MODEL_ID};
use ondemand_deployer::workspace::{DeploymentMeta, DeploymentStatus, WorkspaceStore};
use serde_json::{Value, json};
use tempfile::TempDir;

async fn spawn_server(base: &TempDir) -> String {
    let config = OrchestratorConfig {
        workspace_base: base.path().to_path_buf(),
        key_base_dir: None,
        default_domain: None,
        default_credentials: None,
        iac_tool: IacTool::Terraform,
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        azure_openai: None,
        timeouts: StageTimeouts::default(),
        log_level: "info".to_string(),
        config_warnings: Vec::new(),
    };
    let orchestrator = Orchestrator::new(Arc::new(config));
    orchestrator.restore().expect("restore");
    let app = server::router(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_and_models_answer() {
    let base = TempDir::new().expect("temp dir");
    let url = spawn_server(&base).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{url}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "ok");

    let models: Value = client
        .get(format!("{url}/v1/models"))
        .send()
        .await
        .expect("models")
        .json()
        .await
        .expect("models json");
    assert_eq!(models["data"][0]["id"], MODEL_ID);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_any_workspace_exists() {
    let base = TempDir::new().expect("temp dir");
    let url = spawn_server(&base).await;

    let response = reqwest::Client::new()
        .post(format!("{url}/v1/chat/completions"))
        .json(&json!({"action": "deploy"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["code"], "ValidationError");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("deployment_mode")
    );
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn non_streaming_response_carries_the_outcome() {
    let base = TempDir::new().expect("temp dir");
    let url = spawn_server(&base).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{url}/v1/chat/completions"))
        .json(&json!({
            "action": "decommission",
            "instance_id": "never-deployed",
            "stream": false,
        }))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("completion json");

    assert_eq!(response["object"], "chat.completion");
    assert_eq!(response["choices"][0]["finish_reason"], "stop");
    let content = response["choices"][0]["message"]["content"]
        .as_str()
        .expect("content");
    let outcome: Value = serde_json::from_str(content).expect("outcome json");
    assert_eq!(outcome["deployment_id"], "never-deployed");
    assert_eq!(outcome["error"]["kind"], "ValidationError");
}

#[tokio::test]
async fn streaming_decommission_ends_with_done() {
    let base = TempDir::new().expect("temp dir");
    {
        let store = WorkspaceStore::new(base.path());
        let ws = store.allocate("sse-app").expect("allocate");
        let mut meta = DeploymentMeta::new("sse-app", DeploymentMode::Local);
        meta.status = DeploymentStatus::Succeeded;
        ws.save_meta(&meta).expect("save meta");
    }
    let url = spawn_server(&base).await;

    let body = reqwest::Client::new()
        .post(format!("{url}/v1/chat/completions"))
        .json(&json!({
            "action": "decommission",
            "instance_id": "sse-app",
            "stream": true,
        }))
        .send()
        .await
        .expect("post")
        .text()
        .await
        .expect("stream body");

    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("decommissioned"));
    assert!(body.trim_end().ends_with("data: [DONE]"));
    assert!(!base.path().join("sse-app").exists());
}
