use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::process::{CommandSpec, run_streaming};
use crate::progress::ProgressSender;
use crate::template;
use crate::workspace::Workspace;

pub const LOCAL_CLUSTER_NAME: &str = "ondemand";
pub const NODE_PORT: u16 = 30080;
pub const SSH_USER: &str = "ec2-user";
const OVERLAY_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/flannel-io/flannel/master/Documentation/kube-flannel.yml";
const INGRESS_CHART_REPO: &str = "https://kubernetes.github.io/ingress-nginx";
const BOOTSTRAP_SENTINEL: &str = "/var/lib/bootstrap-complete";

/// A VM reachable over secure shell.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            key_path: key_path.into(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    /// A remote command executed through ssh.
    pub fn command(&self, stage: &str, remote_command: &str) -> CommandSpec {
        CommandSpec::new(stage, "ssh")
            .args(self.base_args())
            .arg(format!("{SSH_USER}@{}", self.host))
            .arg(remote_command)
    }

    /// A file copy onto the VM.
    pub fn copy(&self, stage: &str, local: &Path, remote: &str) -> CommandSpec {
        CommandSpec::new(stage, "scp")
            .args(self.base_args())
            .arg(local.display().to_string())
            .arg(format!("{SSH_USER}@{}:{remote}", self.host))
    }
}

/// Where kubectl commands for a deployment are executed.
#[derive(Debug, Clone)]
pub enum KubeTarget {
    /// Host kubectl, optionally pinned to a kubeconfig or context.
    Local {
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
    },
    /// kubectl on a remote VM, through secure shell.
    Remote(SshTarget),
}

impl KubeTarget {
    pub fn kind_cluster() -> Self {
        KubeTarget::Local {
            kubeconfig: None,
            context: Some(format!("kind-{LOCAL_CLUSTER_NAME}")),
        }
    }

    pub fn kubeconfig(path: impl Into<PathBuf>) -> Self {
        KubeTarget::Local {
            kubeconfig: Some(path.into()),
            context: None,
        }
    }

    /// Build a kubectl invocation for this target.
    pub fn kubectl(&self, stage: &str, args: &[&str]) -> CommandSpec {
        match self {
            KubeTarget::Local {
                kubeconfig,
                context,
            } => {
                let mut spec = CommandSpec::new(stage, "kubectl");
                if let Some(path) = kubeconfig {
                    spec = spec.arg("--kubeconfig").arg(path.display().to_string());
                }
                if let Some(ctx) = context {
                    spec = spec.arg("--context").arg(ctx.clone());
                }
                spec.args(args.iter().map(|s| s.to_string()))
            }
            KubeTarget::Remote(ssh) => {
                let remote = format!("sudo k3s kubectl {}", args.join(" "));
                ssh.command(stage, &remote)
            }
        }
    }
}

/// Ensure the well-known local kind cluster exists, creating it from a
/// rendered config when absent, and make sure the overlay network is in.
pub async fn ensure_local_cluster(
    workspace: &Workspace,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let stage = "cluster-bootstrap";
    let list = CommandSpec::new(stage, "kind")
        .args(["get", "clusters"])
        .timeout(Duration::from_secs(60))
        .quiet();
    let outcome = run_streaming(list, progress).await?.success_or_exit_error()?;
    let exists = outcome
        .tail
        .iter()
        .any(|line| line.trim() == LOCAL_CLUSTER_NAME);

    if exists {
        progress.line(stage, format!("kind cluster '{LOCAL_CLUSTER_NAME}' already running"));
    } else {
        let config_path = workspace.manifests_dir().join("kind-config.yaml");
        let vars = BTreeMap::from([
            ("node_port".to_string(), NODE_PORT.to_string()),
            ("host_port".to_string(), NODE_PORT.to_string()),
        ]);
        template::render_to_file("kind-config.yaml", &vars, &config_path)?;
        let create = CommandSpec::new(stage, "kind")
            .args(["create", "cluster", "--name", LOCAL_CLUSTER_NAME, "--config"])
            .arg(config_path.display().to_string())
            .timeout(timeout)
            .log_to(workspace.stage_log(stage));
        run_streaming(create, progress).await?.success_or_exit_error()?;

        let overlay = KubeTarget::kind_cluster()
            .kubectl(stage, &["apply", "-f", OVERLAY_MANIFEST_URL])
            .timeout(Duration::from_secs(120))
            .log_to(workspace.stage_log(stage));
        run_streaming(overlay, progress).await?.success_or_exit_error()?;
        info!(cluster = LOCAL_CLUSTER_NAME, "kind cluster created");
    }
    Ok(())
}

/// Load a locally built image into the kind cluster's nodes.
pub async fn load_local_image(
    image: &str,
    workspace: &Workspace,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let load = CommandSpec::new("load", "kind")
        .args(["load", "docker-image", image, "--name", LOCAL_CLUSTER_NAME])
        .timeout(timeout)
        .log_to(workspace.stage_log("load"));
    run_streaming(load, progress).await?.success_or_exit_error()?;
    Ok(())
}

/// Poll the VM's bootstrap sentinel until cloud-init and the cluster
/// install have finished.
pub async fn wait_vm_bootstrap(
    ssh: &SshTarget,
    progress: &ProgressSender,
    attempts: u32,
) -> Result<()> {
    let stage = "cluster-bootstrap";
    progress.line(stage, format!("waiting for VM {} to finish bootstrap", ssh.host));
    tokio::time::sleep(Duration::from_secs(2)).await;
    for attempt in 1..=attempts {
        let probe = ssh
            .command(stage, &format!("test -f {BOOTSTRAP_SENTINEL}"))
            .timeout(Duration::from_secs(30))
            .quiet();
        match run_streaming(probe, progress).await {
            Ok(outcome) if outcome.success() => {
                progress.line(stage, "VM bootstrap complete");
                return Ok(());
            }
            Ok(_) | Err(OrchestratorError::SubprocessExit { .. }) => {}
            Err(err) => return Err(err),
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
    Err(OrchestratorError::ClusterBootstrapTimeout {
        attempts,
        detail: format!("VM {} never reported {BOOTSTRAP_SENTINEL}", ssh.host),
    })
}

/// Synthesize a deployment-scoped kubeconfig from the cluster endpoint and
/// CA data in the IaC output bag. Authentication goes through the cloud
/// CLI's token exec, so nothing long-lived lands on disk.
pub fn write_kubeconfig(
    workspace: &Workspace,
    cluster_name: &str,
    endpoint: &str,
    ca_data: &str,
    region: &str,
) -> Result<PathBuf> {
    use base64::Engine as _;
    // Round-trip to reject corrupt CA payloads before kubectl trips on them.
    base64::engine::general_purpose::STANDARD
        .decode(ca_data.trim())
        .map_err(|err| {
            OrchestratorError::Config(format!("cluster CA data is not valid base64: {err}"))
        })?;

    let kubeconfig = format!(
        r#"apiVersion: v1
kind: Config
clusters:
  - name: {cluster_name}
    cluster:
      server: {endpoint}
      certificate-authority-data: {ca_data}
contexts:
  - name: {cluster_name}
    context:
      cluster: {cluster_name}
      user: {cluster_name}
current-context: {cluster_name}
users:
  - name: {cluster_name}
    user:
      exec:
        apiVersion: client.authentication.k8s.io/v1beta1
        command: aws
        args:
          - eks
          - get-token
          - --cluster-name
          - {cluster_name}
          - --region
          - {region}
"#
    );
    let path = workspace.tf_dir().join("kubeconfig");
    fs::write(&path, kubeconfig)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}

/// Install the ingress controller through the package manager with rendered
/// values.
pub async fn install_ingress_controller(
    workspace: &Workspace,
    kubeconfig: &Path,
    env: &[(String, String)],
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let stage = "cluster-bootstrap";
    let values_path = workspace.manifests_dir().join("ingress-values.yaml");
    let vars = BTreeMap::from([("controller_replicas".to_string(), "1".to_string())]);
    template::render_to_file("ingress-values.yaml", &vars, &values_path)?;

    let repo_add = CommandSpec::new(stage, "helm")
        .args(["repo", "add", "ingress-nginx", INGRESS_CHART_REPO, "--force-update"])
        .timeout(Duration::from_secs(120))
        .quiet();
    run_streaming(repo_add, progress).await?.success_or_exit_error()?;

    let repo_update = CommandSpec::new(stage, "helm")
        .args(["repo", "update"])
        .timeout(Duration::from_secs(120))
        .quiet();
    run_streaming(repo_update, progress).await?.success_or_exit_error()?;

    let install = CommandSpec::new(stage, "helm")
        .args([
            "upgrade",
            "--install",
            "ingress-nginx",
            "ingress-nginx/ingress-nginx",
            "--namespace",
            "ingress-nginx",
            "--create-namespace",
            "--wait",
            "--kubeconfig",
        ])
        .arg(kubeconfig.display().to_string())
        .arg("-f")
        .arg(values_path.display().to_string())
        .envs(env)
        .timeout(timeout)
        .log_to(workspace.stage_log(stage));
    run_streaming(install, progress).await?.success_or_exit_error()?;
    Ok(())
}

/// Poll the ingress controller service until the cloud has allocated its
/// load balancer address.
pub async fn wait_ingress_address(
    kubeconfig: &Path,
    env: &[(String, String)],
    progress: &ProgressSender,
    attempts: u32,
) -> Result<String> {
    let stage = "cluster-bootstrap";
    let target = KubeTarget::kubeconfig(kubeconfig);
    for attempt in 1..=attempts {
        let probe = target
            .kubectl(
                stage,
                &[
                    "get",
                    "svc",
                    "ingress-nginx-controller",
                    "-n",
                    "ingress-nginx",
                    "-o",
                    "jsonpath={.status.loadBalancer.ingress[0].hostname}",
                ],
            )
            .envs(env)
            .timeout(Duration::from_secs(30))
            .quiet();
        let outcome = run_streaming(probe, progress).await?;
        if outcome.success() {
            let hostname = outcome.tail.join("").trim().to_string();
            if !hostname.is_empty() {
                progress.line(stage, format!("ingress load balancer at {hostname}"));
                return Ok(hostname);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
    Err(OrchestratorError::IngressTimeout {
        seconds: attempts as u64 * 10,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_kubectl_goes_through_ssh() {
        let ssh = SshTarget::new("10.0.0.5", "/keys/demo.pem");
        let spec = KubeTarget::Remote(ssh).kubectl("apply-manifests", &["get", "pods"]);
        assert_eq!(spec.program, "ssh");
        assert!(spec.args.contains(&"ec2-user@10.0.0.5".to_string()));
        assert!(spec.args.iter().any(|a| a.contains("sudo k3s kubectl get pods")));
    }

    #[test]
    fn local_kubectl_pins_kubeconfig() {
        let spec = KubeTarget::kubeconfig("/ws/tf/kubeconfig").kubectl("load", &["get", "svc"]);
        assert_eq!(spec.program, "kubectl");
        assert_eq!(spec.args[0], "--kubeconfig");
        assert_eq!(spec.args[1], "/ws/tf/kubeconfig");
    }

    #[test]
    fn kind_target_uses_named_context() {
        let spec = KubeTarget::kind_cluster().kubectl("load", &["version"]);
        assert!(spec.args.contains(&format!("kind-{LOCAL_CLUSTER_NAME}")));
    }

    #[test]
    fn scp_addresses_the_vm() {
        let ssh = SshTarget::new("1.2.3.4", "/keys/k.pem");
        let spec = ssh.copy("build", Path::new("/tmp/src.tar"), "/tmp/src.tar");
        assert_eq!(spec.program, "scp");
        assert_eq!(spec.args.last().unwrap(), "ec2-user@1.2.3.4:/tmp/src.tar");
    }
}
