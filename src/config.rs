use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialScope;
use crate::error::{OrchestratorError, Result};
use crate::iac::{IacTool, resolve_iac_tool};

/// Target environment for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    Local,
    CloudLocal,
    CloudHosted,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Local => "local",
            DeploymentMode::CloudLocal => "cloud-local",
            DeploymentMode::CloudHosted => "cloud-hosted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "local" => Some(DeploymentMode::Local),
            "cloud-local" => Some(DeploymentMode::CloudLocal),
            "cloud-hosted" => Some(DeploymentMode::CloudHosted),
            _ => None,
        }
    }

    pub fn is_cloud(&self) -> bool {
        !matches!(self, DeploymentMode::Local)
    }
}

/// Upper bounds for the long-running stages. Subprocess invocations within a
/// stage inherit the stage's budget.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub iac_apply: Duration,
    pub build: Duration,
    pub rollout: Duration,
    pub subprocess: Duration,
    pub pipeline_total: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            iac_apply: Duration::from_secs(30 * 60),
            build: Duration::from_secs(20 * 60),
            rollout: Duration::from_secs(10 * 60),
            subprocess: Duration::from_secs(10 * 60),
            pipeline_total: Duration::from_secs(60 * 60),
        }
    }
}

/// Endpoint for the optional intent extractor.
#[derive(Debug, Clone)]
pub struct AzureOpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
}

/// Complete runtime configuration, assembled from the environment once at
/// startup and shared across all pipelines.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_base: PathBuf,
    pub key_base_dir: Option<PathBuf>,
    pub default_domain: Option<String>,
    pub default_credentials: Option<CredentialScope>,
    pub iac_tool: IacTool,
    pub bind_addr: SocketAddr,
    pub azure_openai: Option<AzureOpenAiConfig>,
    pub timeouts: StageTimeouts,
    pub log_level: String,
    pub config_warnings: Vec<String>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let mut warnings = Vec::new();

        let workspace_base = match env::var("PERSISTENT_WORKSPACE_BASE_DIR") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => {
                warnings.push(
                    "PERSISTENT_WORKSPACE_BASE_DIR not set; using ./workspaces".to_string(),
                );
                PathBuf::from("workspaces")
            }
        };

        let key_base_dir = env::var("EC2_PRIVATE_KEY_BASE_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let default_domain = env::var("DEFAULT_DOMAIN_NAME_FOR_APPS")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let default_credentials = CredentialScope::from_env();
        if default_credentials.is_none() {
            warnings.push(
                "no server-default AWS credentials configured; cloud requests must carry their own"
                    .to_string(),
            );
        }

        let iac_tool = resolve_iac_tool(env::var("IAC_TOOL").ok())?;

        let bind_addr = match env::var("BIND_ADDR") {
            Ok(value) => value.parse().map_err(|err| {
                OrchestratorError::Config(format!("invalid BIND_ADDR '{value}': {err}"))
            })?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 8080)),
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            workspace_base,
            key_base_dir,
            default_domain,
            default_credentials,
            iac_tool,
            bind_addr,
            azure_openai: azure_openai_from_env(&mut warnings),
            timeouts: StageTimeouts::default(),
            log_level,
            config_warnings: warnings,
        })
    }

    /// Resolve an ssh private key file for `key_name`: `<base>/<key_name>.pem`
    /// then `<base>/<key_name>`.
    pub fn ssh_key_path(&self, key_name: &str) -> Result<PathBuf> {
        let base = self.key_base_dir.as_ref().ok_or_else(|| {
            OrchestratorError::Config(
                "EC2_PRIVATE_KEY_BASE_PATH is not set; cannot locate ssh keys".to_string(),
            )
        })?;
        let pem = base.join(format!("{key_name}.pem"));
        if pem.is_file() {
            return Ok(pem);
        }
        let bare = base.join(key_name);
        if bare.is_file() {
            return Ok(bare);
        }
        Err(OrchestratorError::Config(format!(
            "no private key '{key_name}' under {}",
            base.display()
        )))
    }
}

fn azure_openai_from_env(warnings: &mut Vec<String>) -> Option<AzureOpenAiConfig> {
    let endpoint = env::var("AZURE_OPENAI_ENDPOINT").ok()?;
    let api_key = match env::var("AZURE_OPENAI_API_KEY") {
        Ok(key) => key,
        Err(_) => {
            warnings.push(
                "AZURE_OPENAI_ENDPOINT set without AZURE_OPENAI_API_KEY; intent extraction disabled"
                    .to_string(),
            );
            return None;
        }
    };
    let deployment = env::var("AZURE_OPENAI_DEPLOYMENT").unwrap_or_else(|_| "gpt-4o".to_string());
    let api_version =
        env::var("AZURE_OPENAI_API_VERSION").unwrap_or_else(|_| "2024-02-15-preview".to_string());
    Some(AzureOpenAiConfig {
        endpoint,
        api_key,
        deployment,
        api_version,
    })
}
