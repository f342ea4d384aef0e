use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AzureOpenAiConfig;
use crate::request::ChatCompletionRequest;

const EXTRACTION_PROMPT: &str = "You extract deployment parameters from a user's request. \
Reply with a single JSON object using only these keys when the text implies them: \
action (deploy|redeploy|scale|decommission), deployment_mode (local|cloud-local|cloud-hosted), \
github_repo_url, target_namespace, instance_name, instance_id, ec2_key_name, \
base_hosted_zone_id, app_subdomain_label, replicas (number). Omit anything not stated.";

/// Ask the language model to propose values for fields the request left
/// empty. Caller-supplied fields are never overwritten, and any failure
/// leaves the request untouched so validation can ask the user instead.
pub async fn fill_missing(request: &mut ChatCompletionRequest, config: &AzureOpenAiConfig) {
    let Some(user_text) = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
    else {
        return;
    };
    if user_text.trim().is_empty() {
        return;
    }

    let proposal = match extract(config, &user_text).await {
        Ok(value) => value,
        Err(reason) => {
            warn!(%reason, "intent extraction failed; leaving request as supplied");
            return;
        }
    };
    debug!(?proposal, "intent extractor proposal");
    merge(request, &proposal);
}

async fn extract(config: &AzureOpenAiConfig, user_text: &str) -> Result<Value, String> {
    let url = format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        config.endpoint.trim_end_matches('/'),
        config.deployment,
        config.api_version
    );
    let body = json!({
        "messages": [
            {"role": "system", "content": EXTRACTION_PROMPT},
            {"role": "user", "content": user_text},
        ],
        "temperature": 0,
    });

    let response = reqwest::Client::new()
        .post(&url)
        .header("api-key", &config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("model endpoint returned {}", response.status()));
    }
    let payload: Value = response.json().await.map_err(|err| err.to_string())?;
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| "response carried no content".to_string())?;
    serde_json::from_str(strip_fences(content)).map_err(|err| err.to_string())
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn merge(request: &mut ChatCompletionRequest, proposal: &Value) {
    merge_str(&mut request.action, proposal, "action");
    merge_str(&mut request.deployment_mode, proposal, "deployment_mode");
    merge_str(&mut request.github_repo_url, proposal, "github_repo_url");
    merge_str(&mut request.target_namespace, proposal, "target_namespace");
    merge_str(&mut request.instance_name, proposal, "instance_name");
    merge_str(&mut request.instance_id, proposal, "instance_id");
    merge_str(&mut request.ec2_key_name, proposal, "ec2_key_name");
    merge_str(&mut request.base_hosted_zone_id, proposal, "base_hosted_zone_id");
    merge_str(&mut request.app_subdomain_label, proposal, "app_subdomain_label");
    if request.replicas.is_none() {
        if let Some(replicas) = proposal.get("replicas").and_then(Value::as_u64) {
            request.replicas = u32::try_from(replicas).ok();
        }
    }
}

fn merge_str(slot: &mut Option<String>, proposal: &Value, key: &str) {
    if slot.is_none() {
        if let Some(value) = proposal.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                *slot = Some(value.trim().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_never_overwrites_supplied_fields() {
        let mut request = ChatCompletionRequest {
            deployment_mode: Some("local".to_string()),
            ..Default::default()
        };
        let proposal = json!({
            "deployment_mode": "cloud-hosted",
            "github_repo_url": "https://github.com/x/y.git",
            "replicas": 3,
        });
        merge(&mut request, &proposal);
        assert_eq!(request.deployment_mode.as_deref(), Some("local"));
        assert_eq!(
            request.github_repo_url.as_deref(),
            Some("https://github.com/x/y.git")
        );
        assert_eq!(request.replicas, Some(3));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let content = "```json\n{\"action\": \"deploy\"}\n```";
        let parsed: Value = serde_json::from_str(strip_fences(content)).unwrap();
        assert_eq!(parsed["action"], "deploy");
    }

    #[test]
    fn blank_proposal_values_are_ignored() {
        let mut request = ChatCompletionRequest::default();
        merge(&mut request, &json!({"instance_name": "  "}));
        assert!(request.instance_name.is_none());
    }
}
