use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::intent;
use crate::pipeline::{DeploymentOutcome, Orchestrator, OutcomeError};
use crate::progress::{self, ProgressEvent, Severity};
use crate::request::{self, ChatCompletionRequest};
use crate::workspace::DeploymentStatus;

/// Fixed model identifier advertised for client compatibility.
pub const MODEL_ID: &str = "ondemand-deployer";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

pub async fn serve(config: OrchestratorConfig) -> Result<()> {
    let addr = config.bind_addr;
    let orchestrator = Orchestrator::new(Arc::new(config));
    orchestrator.restore()?;
    let app = router(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "chat endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": MODEL_ID,
            "object": "model",
            "created": chrono::Utc::now().timestamp(),
            "owned_by": "ondemand-deployer",
        }],
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(mut request): Json<ChatCompletionRequest>,
) -> Response {
    let config = state.orchestrator.config.clone();

    let mut command = request::validate(&request, &config);
    if command.is_err() {
        // One shot at deriving missing fields from the free text; a failed
        // extraction falls through to the original validation answer.
        if let Some(azure) = &config.azure_openai {
            intent::fill_missing(&mut request, azure).await;
            command = request::validate(&request, &config);
        }
    }
    let command = match command {
        Ok(command) => command,
        Err(err) => return validation_response(&err),
    };

    let (sender, receiver) = progress::channel();
    let sender = match command.credentials() {
        Some(scope) => sender.with_redactions(scope.redaction_values()),
        None => sender,
    };

    let orchestrator = state.orchestrator.clone();
    let deployment_id = command.deployment_id().to_string();
    // The pipeline owns its own task: a disconnecting chat client stops the
    // streaming, never the deployment.
    let handle = tokio::spawn(async move { orchestrator.execute(command, &sender).await });

    if request.stream {
        let deltas = UnboundedReceiverStream::new(receiver).map(|event| {
            Ok::<Event, Infallible>(
                Event::default().data(chunk(Some(delta_text(&event)), None).to_string()),
            )
        });
        let terminal = stream::once(async move {
            let outcome = join_outcome(handle, &deployment_id).await;
            let payload = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
            Ok::<Event, Infallible>(
                Event::default().data(chunk(Some(payload.to_string()), Some("stop")).to_string()),
            )
        })
        .chain(stream::once(async {
            Ok::<Event, Infallible>(Event::default().data("[DONE]"))
        }));
        Sse::new(deltas.chain(terminal))
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        drop(receiver);
        let outcome = join_outcome(handle, &deployment_id).await;
        let payload = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
        Json(json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": MODEL_ID,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": payload.to_string()},
                "finish_reason": "stop",
            }],
        }))
        .into_response()
    }
}

async fn join_outcome(
    handle: tokio::task::JoinHandle<DeploymentOutcome>,
    deployment_id: &str,
) -> DeploymentOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(err) => DeploymentOutcome {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Failed,
            urls: Vec::new(),
            outputs: indexmap::IndexMap::new(),
            error: Some(OutcomeError {
                kind: "PipelinePanic".to_string(),
                message: err.to_string(),
            }),
        },
    }
}

fn delta_text(event: &ProgressEvent) -> String {
    let prefix = match event.severity {
        Severity::Info => "",
        Severity::Warn => "warning: ",
        Severity::Error => "error: ",
    };
    format!("[{}] {prefix}{}\n", event.stage, event.message)
}

fn chunk(content: Option<String>, finish_reason: Option<&str>) -> Value {
    let mut delta = json!({"role": "assistant"});
    if let Some(content) = content {
        delta["content"] = Value::String(content);
    }
    json!({
        "id": completion_id(),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": MODEL_ID,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

fn completion_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("chatcmpl-{nanos:x}")
}

/// Malformed requests come back as a 400 in the OpenAI error shape, before
/// any workspace is touched.
fn validation_response(err: &OrchestratorError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": err.to_string(),
                "type": "invalid_request_error",
                "code": err.kind(),
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;

    #[test]
    fn delta_text_carries_stage_and_severity() {
        let event = ProgressEvent::warn("build", "cache miss");
        assert_eq!(delta_text(&event), "[build] warning: cache miss\n");
        let event = ProgressEvent::log("clone", "done");
        assert_eq!(delta_text(&event), "[clone] done\n");
    }

    #[test]
    fn chunk_shape_matches_chat_completion_chunk() {
        let value = chunk(Some("hello".to_string()), None);
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hello");
        assert_eq!(value["choices"][0]["finish_reason"], Value::Null);
        let done = chunk(None, Some("stop"));
        assert_eq!(done["choices"][0]["finish_reason"], "stop");
    }
}
