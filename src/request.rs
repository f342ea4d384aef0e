use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{DeploymentMode, OrchestratorConfig};
use crate::credentials::{AwsCredentials, CredentialScope};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{DeploymentSpec, LifecycleCommand};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// OpenAI-compatible chat-completion request extended with deployment
/// fields. Standard fields we do not use are accepted and ignored.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub deployment_mode: Option<String>,
    #[serde(default)]
    pub github_repo_url: Option<String>,
    #[serde(default)]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub ec2_key_name: Option<String>,
    #[serde(default)]
    pub aws_credentials: Option<AwsCredentials>,
    #[serde(default)]
    pub base_hosted_zone_id: Option<String>,
    #[serde(default)]
    pub app_subdomain_label: Option<String>,
    #[serde(default)]
    pub application_environment_variables: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Deploy,
    Redeploy,
    Scale,
    Decommission,
}

impl Action {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "deploy" => Some(Action::Deploy),
            "redeploy" => Some(Action::Redeploy),
            "scale" => Some(Action::Scale),
            "decommission" => Some(Action::Decommission),
            _ => None,
        }
    }
}

/// Apply the request validation matrix and produce a runnable lifecycle
/// command. Nothing is allocated on disk before this succeeds.
pub fn validate(
    request: &ChatCompletionRequest,
    config: &OrchestratorConfig,
) -> Result<LifecycleCommand> {
    let action = Action::parse(request.action.as_deref().unwrap_or(""))
        .ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "unknown action '{}'; expected deploy, redeploy, scale or decommission",
                request.action.as_deref().unwrap_or_default()
            ))
        })?;

    match action {
        Action::Deploy => validate_deploy(request, config),
        Action::Redeploy => {
            let id = require_instance_id(request, "redeploy")?;
            Ok(LifecycleCommand::Redeploy {
                id,
                credentials: optional_credentials(request, config)?,
            })
        }
        Action::Scale => {
            let id = require_instance_id(request, "scale")?;
            let replicas = request.replicas.ok_or_else(|| {
                OrchestratorError::Validation("replicas is required for scale".to_string())
            })?;
            Ok(LifecycleCommand::Scale {
                id,
                replicas,
                credentials: optional_credentials(request, config)?,
            })
        }
        Action::Decommission => {
            let id = require_instance_id(request, "decommission")?;
            Ok(LifecycleCommand::Decommission {
                id,
                credentials: optional_credentials(request, config)?,
            })
        }
    }
}

fn validate_deploy(
    request: &ChatCompletionRequest,
    config: &OrchestratorConfig,
) -> Result<LifecycleCommand> {
    let mode_text = request.deployment_mode.as_deref().ok_or_else(|| {
        OrchestratorError::Validation("deployment_mode is required for deploy".to_string())
    })?;
    let mode = DeploymentMode::parse(mode_text).ok_or_else(|| {
        OrchestratorError::Validation(format!(
            "unknown deployment_mode '{mode_text}'; expected local, cloud-local or cloud-hosted"
        ))
    })?;

    let repo_url = request
        .github_repo_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            OrchestratorError::Validation("github_repo_url is required for deploy".to_string())
        })?;

    if mode == DeploymentMode::CloudLocal && request.ec2_key_name.is_none() {
        return Err(OrchestratorError::Validation(
            "ec2_key_name is required for cloud-local deploy".to_string(),
        ));
    }

    match (&request.base_hosted_zone_id, &request.app_subdomain_label) {
        (Some(_), None) | (None, Some(_)) => {
            return Err(OrchestratorError::Validation(
                "base_hosted_zone_id and app_subdomain_label must be supplied together".to_string(),
            ));
        }
        (Some(_), Some(_)) if mode != DeploymentMode::CloudHosted => {
            return Err(OrchestratorError::Validation(
                "custom subdomains are only available in cloud-hosted mode".to_string(),
            ));
        }
        _ => {}
    }

    let credentials = if mode.is_cloud() {
        if request.aws_credentials.is_none() && config.default_credentials.is_none() {
            return Err(OrchestratorError::Validation(format!(
                "aws_credentials is required for {} deployments (no server default configured)",
                mode.as_str()
            )));
        }
        Some(CredentialScope::resolve(
            request.aws_credentials.as_ref(),
            config.default_credentials.as_ref(),
        )?)
    } else {
        None
    };

    let id = match &request.instance_name {
        Some(name) if !name.trim().is_empty() => slugify(name),
        _ => generate_id(&repo_url),
    };

    Ok(LifecycleCommand::Deploy(DeploymentSpec {
        id,
        mode,
        repo_url,
        namespace: request
            .target_namespace
            .clone()
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| "default".to_string()),
        replicas: request.replicas.unwrap_or(1),
        env_vars: request
            .application_environment_variables
            .clone()
            .unwrap_or_default(),
        instance_name: request.instance_name.clone(),
        key_name: request.ec2_key_name.clone(),
        hosted_zone_id: request.base_hosted_zone_id.clone(),
        subdomain: request.app_subdomain_label.clone(),
        credentials,
    }))
}

fn require_instance_id(request: &ChatCompletionRequest, action: &str) -> Result<String> {
    request
        .instance_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            OrchestratorError::Validation(format!("instance_id is required for {action}"))
        })
}

/// Lifecycle actions accept credentials opportunistically; whether they are
/// needed depends on the recorded deployment mode, checked by the pipeline.
fn optional_credentials(
    request: &ChatCompletionRequest,
    config: &OrchestratorConfig,
) -> Result<Option<CredentialScope>> {
    if request.aws_credentials.is_none() && config.default_credentials.is_none() {
        return Ok(None);
    }
    CredentialScope::resolve(
        request.aws_credentials.as_ref(),
        config.default_credentials.as_ref(),
    )
    .map(Some)
}

fn slugify(name: &str) -> String {
    let mut slug: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' }
        })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "app".to_string() } else { slug }
}

fn generate_id(repo_url: &str) -> String {
    let base = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("app")
        .trim_end_matches(".git");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(repo_url.as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    format!("{}-{suffix}", slugify(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageTimeouts;
    use crate::iac::IacTool;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    fn test_config(with_default_creds: bool) -> OrchestratorConfig {
        OrchestratorConfig {
            workspace_base: PathBuf::from("/tmp/ws"),
            key_base_dir: None,
            default_domain: Some("apps.example.com".to_string()),
            default_credentials: with_default_creds.then(|| CredentialScope {
                access_key_id: "AKIADEFAULT".into(),
                secret_access_key: "default-secret".into(),
                session_token: None,
                region: "us-east-1".into(),
            }),
            iac_tool: IacTool::Terraform,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            azure_openai: None,
            timeouts: StageTimeouts::default(),
            log_level: "info".to_string(),
            config_warnings: Vec::new(),
        }
    }

    fn deploy_request(mode: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            deployment_mode: Some(mode.to_string()),
            github_repo_url: Some("https://github.com/x/y.git".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn default_action_is_deploy() {
        let request = deploy_request("local");
        let command = validate(&request, &test_config(false)).unwrap();
        assert!(matches!(command, LifecycleCommand::Deploy(_)));
    }

    #[test]
    fn deploy_requires_mode_and_repo() {
        let config = test_config(false);
        let mut request = ChatCompletionRequest::default();
        let err = validate(&request, &config).unwrap_err();
        assert!(format!("{err}").contains("deployment_mode"));

        request.deployment_mode = Some("local".to_string());
        let err = validate(&request, &config).unwrap_err();
        assert!(format!("{err}").contains("github_repo_url"));
    }

    #[test]
    fn unknown_action_and_mode_are_rejected() {
        let config = test_config(false);
        let mut request = deploy_request("local");
        request.action = Some("teleport".to_string());
        assert!(validate(&request, &config).is_err());

        let request = deploy_request("hybrid");
        assert!(validate(&request, &config).is_err());
    }

    #[test]
    fn cloud_modes_require_credentials_without_server_default() {
        let request = deploy_request("cloud-hosted");
        let err = validate(&request, &test_config(false)).unwrap_err();
        assert!(format!("{err}").contains("aws_credentials"));

        let command = validate(&request, &test_config(true)).unwrap();
        let LifecycleCommand::Deploy(spec) = command else {
            panic!("expected deploy");
        };
        assert!(spec.credentials.is_some());
    }

    #[test]
    fn cloud_local_requires_key_name() {
        let request = deploy_request("cloud-local");
        let err = validate(&request, &test_config(true)).unwrap_err();
        assert!(format!("{err}").contains("ec2_key_name"));
    }

    #[test]
    fn hosted_zone_and_subdomain_are_mutually_required() {
        let config = test_config(true);
        let mut request = deploy_request("cloud-hosted");
        request.base_hosted_zone_id = Some("Z123".to_string());
        let err = validate(&request, &config).unwrap_err();
        assert!(format!("{err}").contains("app_subdomain_label"));

        request.app_subdomain_label = Some("my-app".to_string());
        let command = validate(&request, &config).unwrap();
        let LifecycleCommand::Deploy(spec) = command else {
            panic!("expected deploy");
        };
        assert_eq!(spec.subdomain.as_deref(), Some("my-app"));
    }

    #[test]
    fn subdomain_is_cloud_hosted_only() {
        let config = test_config(true);
        let mut request = deploy_request("local");
        request.base_hosted_zone_id = Some("Z123".to_string());
        request.app_subdomain_label = Some("my-app".to_string());
        let err = validate(&request, &config).unwrap_err();
        assert!(format!("{err}").contains("cloud-hosted"));
    }

    #[test]
    fn lifecycle_actions_require_instance_id() {
        let config = test_config(false);
        for action in ["redeploy", "scale", "decommission"] {
            let request = ChatCompletionRequest {
                action: Some(action.to_string()),
                replicas: Some(2),
                ..Default::default()
            };
            let err = validate(&request, &config).unwrap_err();
            assert!(format!("{err}").contains("instance_id"), "{action}");
        }
    }

    #[test]
    fn scale_requires_replicas() {
        let request = ChatCompletionRequest {
            action: Some("scale".to_string()),
            instance_id: Some("my-app".to_string()),
            ..Default::default()
        };
        let err = validate(&request, &test_config(false)).unwrap_err();
        assert!(format!("{err}").contains("replicas"));
    }

    #[test]
    fn instance_name_becomes_the_id() {
        let mut request = deploy_request("local");
        request.instance_name = Some("My App".to_string());
        let LifecycleCommand::Deploy(spec) = validate(&request, &test_config(false)).unwrap()
        else {
            panic!("expected deploy");
        };
        assert_eq!(spec.id, "my-app");
    }

    #[test]
    fn generated_ids_derive_from_repo_and_differ() {
        let a = generate_id("https://github.com/acme/Shop-Frontend.git");
        assert!(a.starts_with("shop-frontend-"));
        let b = generate_id("https://github.com/acme/Shop-Frontend.git");
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_standard_fields_are_ignored() {
        let raw = r#"{
            "model": "gpt-4o",
            "temperature": 0.2,
            "top_p": 0.9,
            "messages": [{"role": "user", "content": "deploy my app"}],
            "deployment_mode": "local",
            "github_repo_url": "https://github.com/x/y.git"
        }"#;
        let request: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert!(validate(&request, &test_config(false)).is_ok());
    }
}
