use std::fmt;
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::cluster::SshTarget;
use crate::credentials::CredentialScope;
use crate::error::{OrchestratorError, Result};
use crate::process::{CommandSpec, run_streaming};
use crate::progress::ProgressSender;
use crate::workspace::Workspace;

/// {registry, repository, tag} naming one built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{registry}/{}:{}", self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

impl ImageReference {
    /// Deployment-unique reference: the tag carries the deployment id and a
    /// short content-derived suffix, fresh per build so redeploys always
    /// roll a new tag.
    pub fn for_build(deployment_id: &str, commit: &str) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(deployment_id.as_bytes());
        hasher.update(commit.as_bytes());
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let suffix: String = digest
            .iter()
            .take(4)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        Self {
            registry: None,
            repository: deployment_id.to_string(),
            tag: format!("{deployment_id}-{suffix}"),
        }
    }

    /// Re-qualify under a registry repository URL such as an ECR
    /// `<host>/<name>` pair.
    pub fn qualified(&self, repository_url: &str) -> Self {
        match repository_url.split_once('/') {
            Some((host, path)) => Self {
                registry: Some(host.to_string()),
                repository: path.to_string(),
                tag: self.tag.clone(),
            },
            None => Self {
                registry: Some(repository_url.to_string()),
                repository: self.repository.clone(),
                tag: self.tag.clone(),
            },
        }
    }
}

/// Build the image on the local container daemon.
pub async fn build_local(
    workspace: &Workspace,
    image: &ImageReference,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let build = CommandSpec::new("build", "docker")
        .args(["build", "-t", &image.to_string()])
        .arg(workspace.source_dir().display().to_string())
        .timeout(timeout)
        .log_to(workspace.stage_log("build"));
    run_streaming(build, progress).await?.success_or_exit_error()?;
    Ok(())
}

/// Build on the remote VM: ship a tarball of the source over secure shell,
/// build there, then load the image into the VM's cluster runtime.
pub async fn build_remote(
    workspace: &Workspace,
    image: &ImageReference,
    ssh: &SshTarget,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<()> {
    let id = workspace.id().to_string();
    let tarball = workspace.root().join("source.tar");
    write_source_tarball(workspace, &tarball)?;

    let remote_tar = format!("/tmp/{id}-src.tar");
    let remote_dir = format!("/tmp/{id}-build");

    let copy = ssh
        .copy("build", &tarball, &remote_tar)
        .timeout(Duration::from_secs(300))
        .log_to(workspace.stage_log("build"));
    let copied = run_streaming(copy, progress).await;
    let _ = fs::remove_file(&tarball);
    copied?.success_or_exit_error()?;

    let unpack = ssh
        .command(
            "build",
            &format!("rm -rf {remote_dir} && mkdir -p {remote_dir} && tar -xf {remote_tar} -C {remote_dir} && rm -f {remote_tar}"),
        )
        .timeout(Duration::from_secs(120))
        .log_to(workspace.stage_log("build"));
    run_streaming(unpack, progress).await?.success_or_exit_error()?;

    let build = ssh
        .command("build", &format!("sudo docker build -t {image} {remote_dir}"))
        .timeout(timeout)
        .log_to(workspace.stage_log("build"));
    run_streaming(build, progress).await?.success_or_exit_error()?;

    let load = ssh
        .command(
            "load",
            &format!("sudo docker save {image} | sudo k3s ctr images import -"),
        )
        .timeout(Duration::from_secs(600))
        .log_to(workspace.stage_log("load"));
    run_streaming(load, progress).await?.success_or_exit_error()?;
    Ok(())
}

/// Authenticate against the cloud registry, retag, and push. Returns the
/// registry-qualified reference the manifests should use.
pub async fn push_to_registry(
    workspace: &Workspace,
    image: &ImageReference,
    repository_url: &str,
    scope: &CredentialScope,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<ImageReference> {
    let stage = "push";
    let env = scope.env_map();

    let token = CommandSpec::new(stage, "aws")
        .args(["ecr", "get-login-password", "--region", &scope.region])
        .envs(&env)
        .timeout(Duration::from_secs(60))
        .tail_limit(4)
        .quiet();
    let outcome = run_streaming(token, progress).await?.success_or_exit_error()?;
    let password = outcome
        .tail
        .last()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| {
            OrchestratorError::Credential("registry login produced no token".to_string())
        })?;
    // Keep the short-lived registry token out of the chat stream as well.
    let progress = progress.with_redactions(vec![password.clone()]);

    let registry_host = repository_url
        .split('/')
        .next()
        .unwrap_or(repository_url)
        .to_string();
    let login = CommandSpec::new(stage, "docker")
        .args(["login", "--username", "AWS", "--password-stdin", &registry_host])
        .stdin_data(password.into_bytes())
        .timeout(Duration::from_secs(60))
        .log_to(workspace.stage_log(stage));
    run_streaming(login, &progress).await?.success_or_exit_error()?;

    let remote = image.qualified(repository_url);
    let tag = CommandSpec::new(stage, "docker")
        .args(["tag", &image.to_string(), &remote.to_string()])
        .timeout(Duration::from_secs(30))
        .quiet();
    run_streaming(tag, &progress).await?.success_or_exit_error()?;

    let push = CommandSpec::new(stage, "docker")
        .args(["push", &remote.to_string()])
        .timeout(timeout)
        .log_to(workspace.stage_log(stage));
    run_streaming(push, &progress).await?.success_or_exit_error()?;
    Ok(remote)
}

fn write_source_tarball(workspace: &Workspace, tarball: &std::path::Path) -> Result<()> {
    let file = fs::File::create(tarball)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", workspace.source_dir())?;
    builder.finish()?;
    Ok(())
}
