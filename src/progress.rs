use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Where in a stage's lifetime an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Log,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// One unit of observable pipeline progress. Streamed back to the chat
/// client as a completion delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub phase: Phase,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn start(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            phase: Phase::Start,
            severity: Severity::Info,
            message: message.into(),
            data: None,
        }
    }

    pub fn log(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            phase: Phase::Log,
            severity: Severity::Info,
            message: message.into(),
            data: None,
        }
    }

    pub fn warn(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            phase: Phase::Log,
            severity: Severity::Warn,
            message: message.into(),
            data: None,
        }
    }

    pub fn end(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            phase: Phase::End,
            severity: Severity::Info,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            phase: Phase::End,
            severity: Severity::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Fan-out handle for a single pipeline invocation. Every event passes
/// through credential redaction before leaving the process; sends after the
/// consumer disconnected are dropped silently so a closed chat stream never
/// stalls a pipeline.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    redactions: Arc<Vec<String>>,
}

pub fn channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            tx,
            redactions: Arc::new(Vec::new()),
        },
        rx,
    )
}

impl ProgressSender {
    pub fn with_redactions(&self, values: Vec<String>) -> Self {
        let mut all = self.redactions.as_ref().clone();
        all.extend(values.into_iter().filter(|v| !v.is_empty()));
        Self {
            tx: self.tx.clone(),
            redactions: Arc::new(all),
        }
    }

    pub fn emit(&self, mut event: ProgressEvent) {
        event.message = self.redact(&event.message);
        if let Some(data) = event.data.take() {
            event.data = Some(self.redact_value(data));
        }
        match event.severity {
            Severity::Info => info!(stage = %event.stage, "{}", event.message),
            Severity::Warn => warn!(stage = %event.stage, "{}", event.message),
            Severity::Error => error!(stage = %event.stage, "{}", event.message),
        }
        let _ = self.tx.send(event);
    }

    pub fn stage_start(&self, stage: &str, message: impl Into<String>) {
        self.emit(ProgressEvent::start(stage, message));
    }

    pub fn stage_end(&self, stage: &str, message: impl Into<String>) {
        self.emit(ProgressEvent::end(stage, message));
    }

    pub fn line(&self, stage: &str, message: impl Into<String>) {
        self.emit(ProgressEvent::log(stage, message));
    }

    pub fn warning(&self, stage: &str, message: impl Into<String>) {
        self.emit(ProgressEvent::warn(stage, message));
    }

    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.redactions.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***");
            }
        }
        out
    }

    fn redact_value(&self, value: serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.redact(&s)),
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.into_iter().map(|v| self.redact_value(v)).collect(),
            ),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.redact_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_secrets_in_message_and_data() {
        let (sender, mut rx) = channel();
        let sender = sender.with_redactions(vec!["s3cr3t".into(), "AKIA123".into()]);
        sender.emit(
            ProgressEvent::log("build", "login with AKIA123 and s3cr3t done")
                .with_data(serde_json::json!({"token": "s3cr3t", "nested": ["AKIA123"]})),
        );
        let event = rx.try_recv().expect("event delivered");
        assert_eq!(event.message, "login with *** and *** done");
        let data = event.data.expect("data kept");
        assert_eq!(data["token"], "***");
        assert_eq!(data["nested"][0], "***");
    }

    #[test]
    fn send_after_receiver_drop_is_silent() {
        let (sender, rx) = channel();
        drop(rx);
        sender.line("clone", "still running");
    }

    #[test]
    fn empty_redaction_values_are_ignored() {
        let (sender, mut rx) = channel();
        let sender = sender.with_redactions(vec![String::new()]);
        sender.line("clone", "plain text");
        assert_eq!(rx.try_recv().unwrap().message, "plain text");
    }
}
