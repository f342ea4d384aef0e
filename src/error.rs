use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("cannot launch '{binary}': {reason}")]
    SubprocessLaunch { binary: String, reason: String },

    #[error("'{program}' failed during {stage} (exit {code:?}): {tail}")]
    SubprocessExit {
        program: String,
        stage: String,
        code: Option<i32>,
        tail: String,
    },

    #[error(
        "resumed deployment plan is not a no-op ({summary}); refusing to re-apply without operator review"
    )]
    IaCPlanMismatch { summary: String },

    #[error("rollout did not converge within {seconds}s: {last_status}")]
    RolloutTimeout { seconds: u64, last_status: String },

    #[error("cluster bootstrap did not complete after {attempts} attempts: {detail}")]
    ClusterBootstrapTimeout { attempts: u32, detail: String },

    #[error("ingress load balancer address not allocated within {seconds}s")]
    IngressTimeout { seconds: u64 },

    #[error("pipeline exceeded its {seconds}s budget")]
    PipelineTimeout { seconds: u64 },

    #[error("decommission incomplete: {0}")]
    Decommission(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Stable error-kind identifier carried in terminal progress payloads
    /// and persisted into `meta.json`.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "ValidationError",
            OrchestratorError::Config(_) => "ConfigurationError",
            OrchestratorError::Source(_) => "SourceError",
            OrchestratorError::Template(_) => "TemplateError",
            OrchestratorError::SubprocessLaunch { .. } => "SubprocessLaunchError",
            OrchestratorError::SubprocessExit { .. } => "SubprocessExitError",
            OrchestratorError::IaCPlanMismatch { .. } => "IaCPlanMismatch",
            OrchestratorError::RolloutTimeout { .. } => "RolloutTimeout",
            OrchestratorError::ClusterBootstrapTimeout { .. } => "ClusterBootstrapTimeout",
            OrchestratorError::IngressTimeout { .. } => "IngressTimeout",
            OrchestratorError::PipelineTimeout { .. } => "PipelineTimeout",
            OrchestratorError::Decommission(_) => "DecommissionError",
            OrchestratorError::Credential(_) => "CredentialError",
            OrchestratorError::Io(_) => "IoError",
            OrchestratorError::Json(_) => "SerializationError",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
