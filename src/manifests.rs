use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::cluster::KubeTarget;
use crate::error::{OrchestratorError, Result};
use crate::process::run_streaming;
use crate::progress::ProgressSender;
use crate::template;
use crate::workspace::Workspace;

/// Service exposure for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    NodePort(u16),
    ClusterIp,
}

/// Everything the manifest set is derived from: source snapshot facts plus
/// request fields.
#[derive(Debug, Clone)]
pub struct ManifestInputs {
    pub app_name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    pub container_port: u16,
    pub env_vars: BTreeMap<String, String>,
    pub host: Option<String>,
    pub service: ServiceKind,
}

/// Render the fixed manifest set into `manifests/`. Every rendered file is
/// parsed back as YAML before it is allowed near a cluster.
pub fn render_all(workspace: &Workspace, inputs: &ManifestInputs) -> Result<Vec<PathBuf>> {
    let dir = workspace.manifests_dir();
    let mut rendered = Vec::new();

    let mut vars = BTreeMap::from([
        ("app_name".to_string(), inputs.app_name.clone()),
        ("namespace".to_string(), inputs.namespace.clone()),
    ]);
    rendered.push(write_checked(
        "namespace.yaml",
        &vars,
        dir.join("namespace.yaml"),
    )?);

    if !inputs.env_vars.is_empty() {
        let entries: String = inputs
            .env_vars
            .iter()
            .map(|(key, value)| format!("  {key}: {}", BASE64.encode(value)))
            .collect::<Vec<_>>()
            .join("\n");
        vars.insert("data_entries".to_string(), entries);
        rendered.push(write_checked("secret.yaml", &vars, dir.join("secret.yaml"))?);
    }

    let env_from = if inputs.env_vars.is_empty() {
        String::new()
    } else {
        format!(
            "          envFrom:\n            - secretRef:\n                name: {}-env",
            inputs.app_name
        )
    };
    vars.insert("image".to_string(), inputs.image.clone());
    vars.insert("replicas".to_string(), inputs.replicas.to_string());
    vars.insert(
        "container_port".to_string(),
        inputs.container_port.to_string(),
    );
    vars.insert("env_from".to_string(), env_from);
    rendered.push(write_checked(
        "deployment.yaml",
        &vars,
        dir.join("deployment.yaml"),
    )?);

    vars.insert("port".to_string(), inputs.container_port.to_string());
    match inputs.service {
        ServiceKind::NodePort(node_port) => {
            vars.insert("node_port".to_string(), node_port.to_string());
            rendered.push(write_checked(
                "service-nodeport.yaml",
                &vars,
                dir.join("service.yaml"),
            )?);
        }
        ServiceKind::ClusterIp => {
            rendered.push(write_checked(
                "service-clusterip.yaml",
                &vars,
                dir.join("service.yaml"),
            )?);
        }
    }

    if let Some(host) = &inputs.host {
        vars.insert("host".to_string(), host.clone());
        rendered.push(write_checked(
            "ingress.yaml",
            &vars,
            dir.join("ingress.yaml"),
        )?);
    }

    Ok(rendered)
}

fn write_checked(
    template_name: &str,
    vars: &BTreeMap<String, String>,
    path: PathBuf,
) -> Result<PathBuf> {
    let body = template::render(template_name, vars)?;
    serde_yaml_bw::from_str::<serde_yaml_bw::Value>(&body).map_err(|err| {
        OrchestratorError::Template(format!("rendered {template_name} is not valid YAML: {err}"))
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, body)?;
    Ok(path)
}

/// Apply the rendered manifests against the deployment's cluster.
pub async fn apply_all(
    workspace: &Workspace,
    paths: &[PathBuf],
    target: &KubeTarget,
    env: &[(String, String)],
    progress: &ProgressSender,
) -> Result<()> {
    let stage = "apply-manifests";
    for path in paths {
        let file_arg = match target {
            KubeTarget::Local { .. } => path.display().to_string(),
            KubeTarget::Remote(ssh) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("manifest.yaml");
                let remote = format!("/tmp/{}-{name}", workspace.id());
                let copy = ssh
                    .copy(stage, path, &remote)
                    .timeout(Duration::from_secs(60))
                    .quiet();
                run_streaming(copy, progress).await?.success_or_exit_error()?;
                remote
            }
        };
        let apply = target
            .kubectl(stage, &["apply", "-f", &file_arg])
            .envs(env)
            .timeout(Duration::from_secs(120))
            .log_to(workspace.stage_log(stage));
        run_streaming(apply, progress).await?.success_or_exit_error()?;
    }
    Ok(())
}

/// Wait for the workload to converge; a timeout surfaces the last observed
/// rollout status.
pub async fn wait_rollout(
    target: &KubeTarget,
    app_name: &str,
    namespace: &str,
    env: &[(String, String)],
    workspace: &Workspace,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let stage = "wait-rollout";
    let deadline = format!("--timeout={}s", timeout.as_secs());
    let status = target
        .kubectl(
            stage,
            &[
                "rollout",
                "status",
                &format!("deployment/{app_name}"),
                "-n",
                namespace,
                &deadline,
            ],
        )
        .envs(env)
        .timeout(timeout + Duration::from_secs(30))
        .log_to(workspace.stage_log(stage));
    let outcome = run_streaming(status, progress).await?;
    if !outcome.success() {
        return Err(OrchestratorError::RolloutTimeout {
            seconds: timeout.as_secs(),
            last_status: outcome
                .tail
                .last()
                .cloned()
                .unwrap_or_else(|| "no rollout status observed".to_string()),
        });
    }
    Ok(())
}

/// Scaling is a direct patch of the replica count, not a re-render.
pub async fn scale(
    target: &KubeTarget,
    app_name: &str,
    namespace: &str,
    replicas: u32,
    env: &[(String, String)],
    progress: &ProgressSender,
) -> Result<()> {
    let patch = target
        .kubectl(
            "apply-manifests",
            &[
                "scale",
                &format!("deployment/{app_name}"),
                "-n",
                namespace,
                &format!("--replicas={replicas}"),
            ],
        )
        .envs(env)
        .timeout(Duration::from_secs(60));
    run_streaming(patch, progress).await?.success_or_exit_error()?;
    Ok(())
}

/// Roll the workload onto a freshly built tag. The rendered manifest is
/// rewritten in place so the workspace keeps matching the cluster.
pub async fn set_image(
    workspace: &Workspace,
    target: &KubeTarget,
    app_name: &str,
    namespace: &str,
    image: &str,
    env: &[(String, String)],
    progress: &ProgressSender,
) -> Result<()> {
    let roll = target
        .kubectl(
            "apply-manifests",
            &[
                "set",
                "image",
                &format!("deployment/{app_name}"),
                &format!("{app_name}={image}"),
                "-n",
                namespace,
            ],
        )
        .envs(env)
        .timeout(Duration::from_secs(60));
    run_streaming(roll, progress).await?.success_or_exit_error()?;

    let manifest = workspace.manifests_dir().join("deployment.yaml");
    if let Ok(body) = fs::read_to_string(&manifest) {
        let updated: Vec<String> = body
            .lines()
            .map(|line| {
                if line.trim_start().starts_with("image:") {
                    let indent = &line[..line.len() - line.trim_start().len()];
                    format!("{indent}image: {image}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        fs::write(&manifest, updated.join("\n") + "\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceStore;
    use tempfile::tempdir;

    fn inputs() -> ManifestInputs {
        ManifestInputs {
            app_name: "demo".to_string(),
            namespace: "apps".to_string(),
            image: "demo:demo-abcd1234".to_string(),
            replicas: 2,
            container_port: 3000,
            env_vars: BTreeMap::new(),
            host: None,
            service: ServiceKind::NodePort(30080),
        }
    }

    #[test]
    fn renders_core_manifest_set() {
        let base = tempdir().expect("temp dir");
        let ws = WorkspaceStore::new(base.path()).allocate("demo").unwrap();
        let paths = render_all(&ws, &inputs()).unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["namespace.yaml", "deployment.yaml", "service.yaml"]);
        let deployment = fs::read_to_string(&paths[1]).unwrap();
        assert!(deployment.contains("image: demo:demo-abcd1234"));
        assert!(deployment.contains("replicas: 2"));
        assert!(!deployment.contains("envFrom"));
        let service = fs::read_to_string(&paths[2]).unwrap();
        assert!(service.contains("nodePort: 30080"));
    }

    #[test]
    fn env_vars_produce_secret_and_env_from() {
        let base = tempdir().expect("temp dir");
        let ws = WorkspaceStore::new(base.path()).allocate("demo").unwrap();
        let mut i = inputs();
        i.env_vars
            .insert("DATABASE_URL".to_string(), "postgres://db".to_string());
        let paths = render_all(&ws, &i).unwrap();
        let secret = fs::read_to_string(ws.manifests_dir().join("secret.yaml")).unwrap();
        assert!(secret.contains("DATABASE_URL"));
        assert!(secret.contains(&BASE64.encode("postgres://db")));
        assert!(!secret.contains("postgres://db"));
        let deployment = fs::read_to_string(ws.manifests_dir().join("deployment.yaml")).unwrap();
        assert!(deployment.contains("secretRef"));
        assert!(deployment.contains("demo-env"));
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn cloud_hosted_gets_clusterip_and_ingress() {
        let base = tempdir().expect("temp dir");
        let ws = WorkspaceStore::new(base.path()).allocate("demo").unwrap();
        let mut i = inputs();
        i.service = ServiceKind::ClusterIp;
        i.host = Some("my-app.apps.example.com".to_string());
        render_all(&ws, &i).unwrap();
        let service = fs::read_to_string(ws.manifests_dir().join("service.yaml")).unwrap();
        assert!(service.contains("ClusterIP"));
        assert!(!service.contains("nodePort"));
        let ingress = fs::read_to_string(ws.manifests_dir().join("ingress.yaml")).unwrap();
        assert!(ingress.contains("my-app.apps.example.com"));
    }

    #[test]
    fn every_rendered_manifest_is_valid_yaml() {
        let base = tempdir().expect("temp dir");
        let ws = WorkspaceStore::new(base.path()).allocate("demo").unwrap();
        let mut i = inputs();
        i.env_vars.insert("KEY".to_string(), "value".to_string());
        i.host = Some("h.example.com".to_string());
        for path in render_all(&ws, &i).unwrap() {
            let body = fs::read_to_string(&path).unwrap();
            serde_yaml_bw::from_str::<serde_yaml_bw::Value>(&body).expect("valid yaml");
        }
    }
}
