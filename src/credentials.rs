use std::env;
use std::fmt;

use serde::Deserialize;

use crate::error::{OrchestratorError, Result};

/// Cloud credentials as they arrive in a chat request body.
#[derive(Clone, Deserialize, Default)]
pub struct AwsCredentials {
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub aws_session_token: Option<String>,
    #[serde(default)]
    pub aws_region: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("aws_access_key_id", &self.aws_access_key_id.as_deref().map(mask))
            .field("aws_secret_access_key", &self.aws_secret_access_key.as_deref().map(|_| "***"))
            .field("aws_session_token", &self.aws_session_token.as_deref().map(|_| "***"))
            .field("aws_region", &self.aws_region)
            .finish()
    }
}

/// Credentials bound to a single pipeline invocation. Injected into
/// subprocess environments only; never serialized or written to disk.
#[derive(Clone)]
pub struct CredentialScope {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl fmt::Debug for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialScope")
            .field("access_key_id", &mask(&self.access_key_id))
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_deref().map(|_| "***"))
            .field("region", &self.region)
            .finish()
    }
}

impl CredentialScope {
    /// Server-default credentials from the process environment, if complete.
    pub fn from_env() -> Option<Self> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        let region = env::var("AWS_REGION").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: env::var("AWS_SESSION_TOKEN").ok(),
            region,
        })
    }

    /// Resolution order: request body, then server default, then error.
    pub fn resolve(
        request: Option<&AwsCredentials>,
        server_default: Option<&CredentialScope>,
    ) -> Result<Self> {
        if let Some(body) = request {
            if let (Some(key), Some(secret)) = (
                body.aws_access_key_id.as_deref(),
                body.aws_secret_access_key.as_deref(),
            ) {
                let region = body
                    .aws_region
                    .clone()
                    .or_else(|| server_default.map(|d| d.region.clone()))
                    .ok_or_else(|| {
                        OrchestratorError::Credential(
                            "aws_credentials supplied without aws_region and no default region configured"
                                .to_string(),
                        )
                    })?;
                return Ok(Self {
                    access_key_id: key.to_string(),
                    secret_access_key: secret.to_string(),
                    session_token: body.aws_session_token.clone(),
                    region,
                });
            }
        }
        server_default.cloned().ok_or_else(|| {
            OrchestratorError::Credential(
                "no AWS credentials in request and no server default configured".to_string(),
            )
        })
    }

    /// Environment entries injected into every subprocess of the invocation.
    pub fn env_map(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.secret_access_key.clone(),
            ),
            ("AWS_REGION".to_string(), self.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
        ];
        if let Some(token) = &self.session_token {
            entries.push(("AWS_SESSION_TOKEN".to_string(), token.clone()));
        }
        entries
    }

    /// Secret strings that must never surface in progress events.
    pub fn redaction_values(&self) -> Vec<String> {
        let mut values = vec![self.access_key_id.clone(), self.secret_access_key.clone()];
        if let Some(token) = &self.session_token {
            values.push(token.clone());
        }
        values
    }
}

fn mask(value: &str) -> String {
    if value.len() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", &value[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_creds() -> AwsCredentials {
        AwsCredentials {
            aws_access_key_id: Some("AKIAREQUEST".into()),
            aws_secret_access_key: Some("request-secret".into()),
            aws_session_token: None,
            aws_region: Some("eu-west-1".into()),
        }
    }

    fn server_creds() -> CredentialScope {
        CredentialScope {
            access_key_id: "AKIASERVER".into(),
            secret_access_key: "server-secret".into(),
            session_token: None,
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn request_credentials_win_over_server_default() {
        let scope =
            CredentialScope::resolve(Some(&request_creds()), Some(&server_creds())).unwrap();
        assert_eq!(scope.access_key_id, "AKIAREQUEST");
        assert_eq!(scope.region, "eu-west-1");
    }

    #[test]
    fn falls_back_to_server_default() {
        let scope = CredentialScope::resolve(None, Some(&server_creds())).unwrap();
        assert_eq!(scope.access_key_id, "AKIASERVER");
    }

    #[test]
    fn region_falls_back_to_server_default() {
        let mut creds = request_creds();
        creds.aws_region = None;
        let scope = CredentialScope::resolve(Some(&creds), Some(&server_creds())).unwrap();
        assert_eq!(scope.access_key_id, "AKIAREQUEST");
        assert_eq!(scope.region, "us-east-1");
    }

    #[test]
    fn fails_when_nothing_configured() {
        let err = CredentialScope::resolve(None, None).unwrap_err();
        assert_eq!(err.kind(), "CredentialError");
    }

    #[test]
    fn debug_never_prints_secrets() {
        let rendered = format!("{:?}", server_creds());
        assert!(!rendered.contains("server-secret"));
        assert!(!rendered.contains("AKIASERVER"));

        let rendered = format!("{:?}", request_creds());
        assert!(!rendered.contains("request-secret"));
        assert!(!rendered.contains("AKIAREQUEST"));
    }

    #[test]
    fn env_map_includes_session_token_when_present() {
        let mut scope = server_creds();
        scope.session_token = Some("tok".into());
        let env = scope.env_map();
        assert!(env.iter().any(|(k, _)| k == "AWS_SESSION_TOKEN"));
        assert_eq!(scope.redaction_values().len(), 3);
    }
}
