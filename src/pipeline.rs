use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::cluster::{self, KubeTarget, NODE_PORT, SshTarget};
use crate::config::{DeploymentMode, OrchestratorConfig};
use crate::credentials::CredentialScope;
use crate::error::{OrchestratorError, Result};
use crate::iac::{IacDriver, StreamingIacRunner};
use crate::image::{self, ImageReference};
use crate::manifests::{self, ManifestInputs, ServiceKind};
use crate::progress::{ProgressEvent, ProgressSender};
use crate::source::{self, SourceSnapshot};
use crate::template;
use crate::workspace::{
    self, DeploymentMeta, DeploymentStatus, MetaError, Workspace, WorkspaceStore,
};

/// Fully validated deployment request, ready to run.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub id: String,
    pub mode: DeploymentMode,
    pub repo_url: String,
    pub namespace: String,
    pub replicas: u32,
    pub env_vars: BTreeMap<String, String>,
    pub instance_name: Option<String>,
    pub key_name: Option<String>,
    pub hosted_zone_id: Option<String>,
    pub subdomain: Option<String>,
    pub credentials: Option<CredentialScope>,
}

/// One lifecycle action against a deployment id.
#[derive(Debug, Clone)]
pub enum LifecycleCommand {
    Deploy(DeploymentSpec),
    Redeploy {
        id: String,
        credentials: Option<CredentialScope>,
    },
    Scale {
        id: String,
        replicas: u32,
        credentials: Option<CredentialScope>,
    },
    Decommission {
        id: String,
        credentials: Option<CredentialScope>,
    },
}

impl LifecycleCommand {
    pub fn deployment_id(&self) -> &str {
        match self {
            LifecycleCommand::Deploy(spec) => &spec.id,
            LifecycleCommand::Redeploy { id, .. }
            | LifecycleCommand::Scale { id, .. }
            | LifecycleCommand::Decommission { id, .. } => id,
        }
    }

    pub fn credentials(&self) -> Option<&CredentialScope> {
        match self {
            LifecycleCommand::Deploy(spec) => spec.credentials.as_ref(),
            LifecycleCommand::Redeploy { credentials, .. }
            | LifecycleCommand::Scale { credentials, .. }
            | LifecycleCommand::Decommission { credentials, .. } => credentials.as_ref(),
        }
    }
}

/// Process-wide map of active deployment ids to their last known status.
/// The mutex is held only across O(1) operations, never across a stage.
#[derive(Clone, Default)]
pub struct ActiveRegistry {
    inner: Arc<StdMutex<HashMap<String, DeploymentStatus>>>,
}

impl ActiveRegistry {
    pub fn status(&self, id: &str) -> Option<DeploymentStatus> {
        self.inner.lock().expect("registry poisoned").get(id).copied()
    }

    pub fn set(&self, id: &str, status: DeploymentStatus) {
        self.inner
            .lock()
            .expect("registry poisoned")
            .insert(id.to_string(), status);
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().expect("registry poisoned").remove(id);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutcomeError {
    pub kind: String,
    pub message: String,
}

/// Terminal result of one lifecycle invocation, embedded in the final chat
/// delta.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub urls: Vec<String>,
    pub outputs: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl DeploymentOutcome {
    fn ok(
        id: &str,
        status: DeploymentStatus,
        urls: Vec<String>,
        outputs: IndexMap<String, String>,
    ) -> Self {
        Self {
            deployment_id: id.to_string(),
            status,
            urls,
            outputs,
            error: None,
        }
    }
}

/// Owns the shared pieces every pipeline needs.
#[derive(Clone)]
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub store: WorkspaceStore,
    pub registry: ActiveRegistry,
}

impl Orchestrator {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        let store = WorkspaceStore::new(config.workspace_base.clone());
        Self {
            config,
            store,
            registry: ActiveRegistry::default(),
        }
    }

    /// Seed the registry from workspaces left by previous runs so lifecycle
    /// preconditions keep holding across restarts.
    pub fn restore(&self) -> Result<()> {
        for id in self.store.list()? {
            if let Ok(meta) = self.store.locate(&id).and_then(|ws| ws.load_meta()) {
                self.registry.set(&id, meta.status);
            }
        }
        Ok(())
    }

    /// Run one lifecycle command to completion. Never panics the caller:
    /// every failure is folded into the outcome.
    pub async fn execute(
        &self,
        command: LifecycleCommand,
        progress: &ProgressSender,
    ) -> DeploymentOutcome {
        let id = command.deployment_id().to_string();
        let budget = self.config.timeouts.pipeline_total;
        let run = self.dispatch(command, progress);
        let result = match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => {
                // The stage future was dropped mid-flight; make sure the
                // workspace record still reaches a terminal state.
                self.mark_timed_out(&id);
                Err(OrchestratorError::PipelineTimeout {
                    seconds: budget.as_secs(),
                })
            }
        };
        match result {
            Ok(outcome) => {
                progress.emit(
                    ProgressEvent::end(
                        "pipeline",
                        format!("deployment '{id}' {}", outcome.status.as_str()),
                    )
                    .with_data(json!({"status": outcome.status.as_str()})),
                );
                outcome
            }
            Err(err) => {
                let status = match err {
                    OrchestratorError::Decommission(_) => DeploymentStatus::DecommissionAttempted,
                    _ => DeploymentStatus::Failed,
                };
                progress.emit(
                    ProgressEvent::failure("pipeline", err.to_string())
                        .with_data(json!({"error_kind": err.kind()})),
                );
                DeploymentOutcome {
                    deployment_id: id,
                    status,
                    urls: Vec::new(),
                    outputs: IndexMap::new(),
                    error: Some(OutcomeError {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        command: LifecycleCommand,
        progress: &ProgressSender,
    ) -> Result<DeploymentOutcome> {
        let _lock = workspace::lock_deployment(command.deployment_id())?;
        match command {
            LifecycleCommand::Deploy(spec) => self.run_deploy(spec, progress).await,
            LifecycleCommand::Redeploy { id, credentials } => {
                self.run_redeploy(&id, credentials, progress).await
            }
            LifecycleCommand::Scale {
                id,
                replicas,
                credentials,
            } => self.run_scale(&id, replicas, credentials, progress).await,
            LifecycleCommand::Decommission { id, credentials } => {
                self.run_decommission(&id, credentials, progress).await
            }
        }
    }

    // ----- deploy -----

    async fn run_deploy(
        &self,
        spec: DeploymentSpec,
        progress: &ProgressSender,
    ) -> Result<DeploymentOutcome> {
        self.precheck(&spec)?;

        let (ws, resumed) = if self.store.exists(&spec.id) {
            let ws = self.store.locate(&spec.id)?;
            let meta = ws.load_meta()?;
            if meta.status == DeploymentStatus::Failed {
                info!(deployment = %spec.id, "resuming failed deployment");
                (ws, true)
            } else {
                return Err(OrchestratorError::Validation(format!(
                    "deployment '{}' already exists with status {}",
                    spec.id,
                    meta.status.as_str()
                )));
            }
        } else {
            (self.store.allocate(&spec.id)?, false)
        };

        let mut meta = if resumed {
            let mut existing = ws.load_meta()?;
            existing.mode = spec.mode;
            existing.last_error = None;
            existing
        } else {
            DeploymentMeta::new(&spec.id, spec.mode)
        };
        meta.repo_url = Some(spec.repo_url.clone());
        meta.namespace = spec.namespace.clone();
        meta.replicas = spec.replicas;
        meta.key_name = spec.key_name.clone();
        self.set_status(&ws, &mut meta, DeploymentStatus::Running)?;

        match self.deploy_stages(&ws, &mut meta, &spec, resumed, progress).await {
            Ok((urls, outputs)) => {
                meta.outputs = outputs.clone();
                self.set_status(&ws, &mut meta, DeploymentStatus::Succeeded)?;
                Ok(DeploymentOutcome::ok(
                    &spec.id,
                    DeploymentStatus::Succeeded,
                    urls,
                    outputs,
                ))
            }
            Err(err) => {
                self.record_failure(&ws, &mut meta, &err);
                Err(err)
            }
        }
    }

    /// Configuration problems abort before any external call is made.
    fn precheck(&self, spec: &DeploymentSpec) -> Result<()> {
        if spec.mode == DeploymentMode::CloudLocal {
            let key_name = spec.key_name.as_deref().ok_or_else(|| {
                OrchestratorError::Validation(
                    "ec2_key_name is required for cloud-local deployments".to_string(),
                )
            })?;
            self.config.ssh_key_path(key_name)?;
        }
        if spec.hosted_zone_id.is_some() && self.config.default_domain.is_none() {
            return Err(OrchestratorError::Config(
                "DEFAULT_DOMAIN_NAME_FOR_APPS must be set to use a custom subdomain".to_string(),
            ));
        }
        Ok(())
    }

    async fn deploy_stages(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        spec: &DeploymentSpec,
        resumed: bool,
        progress: &ProgressSender,
    ) -> Result<(Vec<String>, IndexMap<String, String>)> {
        progress.stage_start("clone", format!("cloning {}", spec.repo_url));
        let snapshot = source::fetch(
            &spec.repo_url,
            ws,
            progress,
            self.config.timeouts.subprocess,
        )
        .await?;
        if !snapshot.has_dockerfile {
            return Err(OrchestratorError::Source(format!(
                "{} has no container build recipe; add a Dockerfile at the repository root",
                spec.repo_url
            )));
        }
        progress.stage_end("clone", format!("checked out {}", short(&snapshot.commit)));

        match spec.mode {
            DeploymentMode::Local => self.deploy_local(ws, meta, spec, &snapshot, progress).await,
            DeploymentMode::CloudLocal => {
                self.deploy_cloud_local(ws, meta, spec, &snapshot, resumed, progress)
                    .await
            }
            DeploymentMode::CloudHosted => {
                self.deploy_cloud_hosted(ws, meta, spec, &snapshot, resumed, progress)
                    .await
            }
        }
    }

    async fn deploy_local(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        spec: &DeploymentSpec,
        snapshot: &SourceSnapshot,
        progress: &ProgressSender,
    ) -> Result<(Vec<String>, IndexMap<String, String>)> {
        let t = &self.config.timeouts;
        let image = ImageReference::for_build(&spec.id, &snapshot.commit);

        progress.stage_start("render", "rendering manifests");
        let paths = manifests::render_all(
            ws,
            &ManifestInputs {
                app_name: spec.id.clone(),
                namespace: spec.namespace.clone(),
                image: image.to_string(),
                replicas: spec.replicas,
                container_port: snapshot.ports[0],
                env_vars: spec.env_vars.clone(),
                host: None,
                service: ServiceKind::NodePort(NODE_PORT),
            },
        )?;
        progress.stage_end("render", format!("{} manifests ready", paths.len()));

        progress.stage_start("build", format!("building {image}"));
        image::build_local(ws, &image, progress, t.build).await?;
        meta.image_ref = Some(image.to_string());
        ws.save_meta(meta)?;
        progress.stage_end("build", "image built");

        progress.stage_start("cluster-bootstrap", "ensuring local cluster");
        cluster::ensure_local_cluster(ws, progress, t.subprocess).await?;
        progress.stage_start("load", "loading image into cluster");
        cluster::load_local_image(&image.to_string(), ws, progress, t.subprocess).await?;
        progress.stage_end("cluster-bootstrap", "cluster ready");

        let target = KubeTarget::kind_cluster();
        progress.stage_start("apply-manifests", "applying manifests");
        manifests::apply_all(ws, &paths, &target, &[], progress).await?;
        progress.stage_start("wait-rollout", "waiting for rollout");
        manifests::wait_rollout(
            &target,
            &spec.id,
            &spec.namespace,
            &[],
            ws,
            progress,
            t.rollout,
        )
        .await?;
        progress.stage_end("wait-rollout", "rollout complete");

        Ok((vec![format!("http://localhost:{NODE_PORT}")], IndexMap::new()))
    }

    async fn deploy_cloud_local(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        spec: &DeploymentSpec,
        snapshot: &SourceSnapshot,
        resumed: bool,
        progress: &ProgressSender,
    ) -> Result<(Vec<String>, IndexMap<String, String>)> {
        let t = &self.config.timeouts;
        let scope = self.require_credentials(spec.credentials.as_ref())?;
        let key_name = spec.key_name.clone().ok_or_else(|| {
            OrchestratorError::Validation(
                "ec2_key_name is required for cloud-local deployments".to_string(),
            )
        })?;
        let key_path = self.config.ssh_key_path(&key_name)?;

        progress.stage_start("render", "rendering infrastructure definition");
        let tf_vars = BTreeMap::from([("deployment_id".to_string(), spec.id.clone())]);
        template::render_to_file("ec2.tf", &tf_vars, &ws.tf_dir().join("main.tf"))?;
        progress.stage_end("render", "infrastructure definition ready");

        let iac_vars = BTreeMap::from([
            ("aws_region".to_string(), scope.region.clone()),
            (
                "instance_name".to_string(),
                spec.instance_name.clone().unwrap_or_else(|| spec.id.clone()),
            ),
            ("key_name".to_string(), key_name),
            ("node_port".to_string(), NODE_PORT.to_string()),
        ]);
        let outputs = self
            .run_iac_apply(ws, &scope, &iac_vars, resumed, progress)
            .await?;
        let public_ip = require_output(&outputs, "public_ip")?;
        let ssh = SshTarget::new(public_ip.clone(), key_path);

        let image = ImageReference::for_build(&spec.id, &snapshot.commit);
        progress.stage_start("cluster-bootstrap", "waiting for VM bootstrap");
        cluster::wait_vm_bootstrap(&ssh, progress, 60).await?;
        progress.stage_end("cluster-bootstrap", "VM cluster ready");

        progress.stage_start("build", format!("building {image} on {public_ip}"));
        image::build_remote(ws, &image, &ssh, progress, t.build).await?;
        meta.image_ref = Some(image.to_string());
        ws.save_meta(meta)?;
        progress.stage_end("build", "image built and loaded");

        let paths = manifests::render_all(
            ws,
            &ManifestInputs {
                app_name: spec.id.clone(),
                namespace: spec.namespace.clone(),
                image: image.to_string(),
                replicas: spec.replicas,
                container_port: snapshot.ports[0],
                env_vars: spec.env_vars.clone(),
                host: None,
                service: ServiceKind::NodePort(NODE_PORT),
            },
        )?;
        let target = KubeTarget::Remote(ssh);
        progress.stage_start("apply-manifests", "applying manifests on VM");
        manifests::apply_all(ws, &paths, &target, &[], progress).await?;
        progress.stage_start("wait-rollout", "waiting for rollout");
        manifests::wait_rollout(
            &target,
            &spec.id,
            &spec.namespace,
            &[],
            ws,
            progress,
            t.rollout,
        )
        .await?;
        progress.stage_end("wait-rollout", "rollout complete");

        let urls = vec![format!("http://{public_ip}:{NODE_PORT}")];
        Ok((urls, outputs))
    }

    async fn deploy_cloud_hosted(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        spec: &DeploymentSpec,
        snapshot: &SourceSnapshot,
        resumed: bool,
        progress: &ProgressSender,
    ) -> Result<(Vec<String>, IndexMap<String, String>)> {
        let t = &self.config.timeouts;
        let scope = self.require_credentials(spec.credentials.as_ref())?;
        let cluster_name = format!("{}-eks", spec.id);

        progress.stage_start("render", "rendering infrastructure definition");
        let tf_vars = BTreeMap::from([("deployment_id".to_string(), spec.id.clone())]);
        template::render_to_file("eks-cluster.tf", &tf_vars, &ws.tf_dir().join("main.tf"))?;
        progress.stage_end("render", "infrastructure definition ready");

        let iac_vars = BTreeMap::from([
            ("aws_region".to_string(), scope.region.clone()),
            ("cluster_name".to_string(), cluster_name.clone()),
        ]);
        let mut outputs = self
            .run_iac_apply(ws, &scope, &iac_vars, resumed, progress)
            .await?;

        let image = ImageReference::for_build(&spec.id, &snapshot.commit);
        progress.stage_start("build", format!("building {image}"));
        image::build_local(ws, &image, progress, t.build).await?;
        progress.stage_end("build", "image built");

        progress.stage_start("push", "publishing image to registry");
        let repository_url = require_output(&outputs, "ecr_repository_url")?;
        let remote_image =
            image::push_to_registry(ws, &image, &repository_url, &scope, progress, t.build)
                .await?;
        meta.image_ref = Some(remote_image.to_string());
        ws.save_meta(meta)?;
        progress.stage_end("push", format!("pushed {remote_image}"));

        progress.stage_start("cluster-bootstrap", "configuring cluster access");
        let endpoint = require_output(&outputs, "eks_cluster_endpoint")?;
        let ca_data = require_output(&outputs, "eks_cluster_ca_data")?;
        let kubeconfig =
            cluster::write_kubeconfig(ws, &cluster_name, &endpoint, &ca_data, &scope.region)?;
        let env = scope.env_map();
        cluster::install_ingress_controller(ws, &kubeconfig, &env, progress, t.subprocess).await?;
        let lb_address = cluster::wait_ingress_address(&kubeconfig, &env, progress, 60).await?;
        progress.stage_end("cluster-bootstrap", "ingress controller ready");

        let mut urls = Vec::new();
        let host = match (&spec.hosted_zone_id, &spec.subdomain) {
            (Some(zone_id), Some(label)) => {
                let domain = self.config.default_domain.as_ref().ok_or_else(|| {
                    OrchestratorError::Config(
                        "DEFAULT_DOMAIN_NAME_FOR_APPS must be set to use a custom subdomain"
                            .to_string(),
                    )
                })?;
                let fqdn = format!("{label}.{domain}");
                // The load balancer address only exists now, so DNS and TLS
                // land in a second apply with it injected as an input.
                template::render_to_file("eks-dns.tf", &tf_vars, &ws.tf_dir().join("dns.tf"))?;
                let dns_vars = BTreeMap::from([
                    ("base_hosted_zone_id".to_string(), zone_id.clone()),
                    ("app_fqdn".to_string(), fqdn.clone()),
                    ("ingress_lb_dns_name".to_string(), lb_address.clone()),
                ]);
                let dns_outputs = self
                    .run_iac_apply(ws, &scope, &dns_vars, false, progress)
                    .await?;
                outputs.extend(dns_outputs);
                meta.domain = Some(fqdn.clone());
                urls.push(
                    outputs
                        .get("app_url_https")
                        .cloned()
                        .unwrap_or_else(|| format!("https://{fqdn}")),
                );
                fqdn
            }
            _ => {
                urls.push(format!("http://{lb_address}"));
                lb_address.clone()
            }
        };

        let paths = manifests::render_all(
            ws,
            &ManifestInputs {
                app_name: spec.id.clone(),
                namespace: spec.namespace.clone(),
                image: remote_image.to_string(),
                replicas: spec.replicas,
                container_port: snapshot.ports[0],
                env_vars: spec.env_vars.clone(),
                host: Some(host),
                service: ServiceKind::ClusterIp,
            },
        )?;
        let target = KubeTarget::kubeconfig(&kubeconfig);
        progress.stage_start("apply-manifests", "applying manifests");
        manifests::apply_all(ws, &paths, &target, &env, progress).await?;
        progress.stage_start("wait-rollout", "waiting for rollout");
        manifests::wait_rollout(
            &target,
            &spec.id,
            &spec.namespace,
            &env,
            ws,
            progress,
            t.rollout,
        )
        .await?;
        progress.stage_end("wait-rollout", "rollout complete");

        Ok((urls, outputs))
    }

    /// init → plan → apply (or, on a no-op resumption, re-read outputs).
    /// The state marker goes down before apply so a partial failure still
    /// blocks workspace release.
    async fn run_iac_apply(
        &self,
        ws: &Workspace,
        scope: &CredentialScope,
        vars: &BTreeMap<String, String>,
        resumed: bool,
        progress: &ProgressSender,
    ) -> Result<IndexMap<String, String>> {
        let runner = StreamingIacRunner {
            progress: progress.clone(),
            log_dir: Some(ws.logs_dir()),
            timeout: self.config.timeouts.iac_apply,
        };
        let driver = IacDriver::new(
            self.config.iac_tool,
            &runner,
            ws.tf_dir(),
            scope.env_map(),
        );

        progress.stage_start("iac-init", "initializing IaC working directory");
        driver.init().await?;
        progress.stage_start("iac-plan", "planning infrastructure changes");
        let plan = driver.plan(vars).await?;
        progress.line("iac-plan", plan.summary.clone());

        let had_state = resumed && IacDriver::state_present(&ws.tf_dir());
        if had_state && !plan.has_changes {
            progress.stage_end("iac-apply", "existing infrastructure is current; reusing outputs");
            return driver.outputs().await;
        }
        if had_state && plan.has_changes {
            return Err(OrchestratorError::IaCPlanMismatch {
                summary: plan.summary,
            });
        }

        progress.stage_start("iac-apply", "applying infrastructure changes");
        ws.mark_state_exists()?;
        let outputs = driver.apply().await?;
        progress.stage_end("iac-apply", format!("{} outputs available", outputs.len()));
        Ok(outputs)
    }

    // ----- redeploy -----

    async fn run_redeploy(
        &self,
        id: &str,
        credentials: Option<CredentialScope>,
        progress: &ProgressSender,
    ) -> Result<DeploymentOutcome> {
        let ws = self.store.locate(id)?;
        let mut meta = ws.load_meta()?;
        if !matches!(
            meta.status,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed
        ) {
            return Err(OrchestratorError::Validation(format!(
                "redeploy requires a succeeded or failed deployment; '{id}' is {}",
                meta.status.as_str()
            )));
        }
        let repo_url = meta.repo_url.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!("deployment '{id}' has no recorded repository"))
        })?;
        self.set_status(&ws, &mut meta, DeploymentStatus::Running)?;

        let result = self
            .redeploy_stages(&ws, &mut meta, &repo_url, credentials, progress)
            .await;
        match result {
            Ok(()) => {
                self.set_status(&ws, &mut meta, DeploymentStatus::Succeeded)?;
                Ok(DeploymentOutcome::ok(
                    id,
                    DeploymentStatus::Succeeded,
                    Vec::new(),
                    meta.outputs.clone(),
                ))
            }
            Err(err) => {
                self.record_failure(&ws, &mut meta, &err);
                Err(err)
            }
        }
    }

    /// Rebuild the image and roll the workload; IaC is deliberately left
    /// untouched when only the source changed.
    async fn redeploy_stages(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        repo_url: &str,
        credentials: Option<CredentialScope>,
        progress: &ProgressSender,
    ) -> Result<()> {
        let t = &self.config.timeouts;
        progress.stage_start("clone", format!("refreshing {repo_url}"));
        let snapshot = source::fetch(repo_url, ws, progress, t.subprocess).await?;
        if !snapshot.has_dockerfile {
            return Err(OrchestratorError::Source(format!(
                "{repo_url} no longer has a container build recipe"
            )));
        }
        progress.stage_end("clone", format!("checked out {}", short(&snapshot.commit)));

        let image = ImageReference::for_build(&meta.id, &snapshot.commit);
        let mut env: Vec<(String, String)> = Vec::new();
        let rolled_image = match meta.mode {
            DeploymentMode::Local => {
                progress.stage_start("build", format!("building {image}"));
                image::build_local(ws, &image, progress, t.build).await?;
                cluster::load_local_image(&image.to_string(), ws, progress, t.subprocess).await?;
                progress.stage_end("build", "image built and loaded");
                image.to_string()
            }
            DeploymentMode::CloudLocal => {
                let ssh = self.ssh_target(ws, meta)?;
                progress.stage_start("build", format!("building {image} on {}", ssh.host));
                image::build_remote(ws, &image, &ssh, progress, t.build).await?;
                progress.stage_end("build", "image built and loaded");
                image.to_string()
            }
            DeploymentMode::CloudHosted => {
                let scope = self.require_credentials(credentials.as_ref())?;
                env = scope.env_map();
                progress.stage_start("build", format!("building {image}"));
                image::build_local(ws, &image, progress, t.build).await?;
                progress.stage_start("push", "publishing image to registry");
                let repository_url = require_output(&meta.outputs, "ecr_repository_url")?;
                let remote =
                    image::push_to_registry(ws, &image, &repository_url, &scope, progress, t.build)
                        .await?;
                progress.stage_end("push", format!("pushed {remote}"));
                remote.to_string()
            }
        };

        let target = self.kube_target(ws, meta)?;
        progress.stage_start("apply-manifests", "rolling new image");
        manifests::set_image(
            ws,
            &target,
            &meta.id,
            &meta.namespace,
            &rolled_image,
            &env,
            progress,
        )
        .await?;
        progress.stage_start("wait-rollout", "waiting for rollout");
        manifests::wait_rollout(
            &target,
            &meta.id,
            &meta.namespace,
            &env,
            ws,
            progress,
            t.rollout,
        )
        .await?;
        progress.stage_end("wait-rollout", "rollout complete");

        meta.image_ref = Some(rolled_image);
        ws.save_meta(meta)?;
        Ok(())
    }

    // ----- scale -----

    async fn run_scale(
        &self,
        id: &str,
        replicas: u32,
        credentials: Option<CredentialScope>,
        progress: &ProgressSender,
    ) -> Result<DeploymentOutcome> {
        let ws = self.store.locate(id)?;
        let mut meta = ws.load_meta()?;
        if meta.status != DeploymentStatus::Succeeded {
            return Err(OrchestratorError::Validation(format!(
                "scale requires a succeeded deployment; '{id}' is {}",
                meta.status.as_str()
            )));
        }

        let env = if meta.mode == DeploymentMode::CloudHosted {
            self.require_credentials(credentials.as_ref())?.env_map()
        } else {
            Vec::new()
        };
        let target = self.kube_target(&ws, &meta)?;
        progress.stage_start("apply-manifests", format!("scaling to {replicas} replicas"));
        manifests::scale(&target, id, &meta.namespace, replicas, &env, progress).await?;
        progress.stage_end("apply-manifests", "scale applied");

        meta.replicas = replicas;
        meta.touch();
        ws.save_meta(&meta)?;
        Ok(DeploymentOutcome::ok(
            id,
            DeploymentStatus::Succeeded,
            Vec::new(),
            meta.outputs.clone(),
        ))
    }

    // ----- decommission -----

    async fn run_decommission(
        &self,
        id: &str,
        credentials: Option<CredentialScope>,
        progress: &ProgressSender,
    ) -> Result<DeploymentOutcome> {
        let ws = self.store.locate(id)?;
        let mut meta = ws.load_meta()?;
        self.set_status(&ws, &mut meta, DeploymentStatus::Decommissioning)?;
        progress.stage_start("iac-destroy", format!("decommissioning '{id}'"));

        match meta.mode {
            DeploymentMode::Local => {
                // Nothing cloud-side to reclaim; drop the namespace from the
                // shared local cluster if it is still around.
                let delete = KubeTarget::kind_cluster()
                    .kubectl(
                        "iac-destroy",
                        &[
                            "delete",
                            "namespace",
                            &meta.namespace,
                            "--ignore-not-found",
                        ],
                    )
                    .timeout(Duration::from_secs(120))
                    .quiet();
                match crate::process::run_streaming(delete, progress).await {
                    Ok(outcome) if !outcome.success() => {
                        progress.warning(
                            "iac-destroy",
                            format!("namespace cleanup skipped: {}", outcome.tail_text()),
                        );
                    }
                    Err(err) => {
                        progress.warning("iac-destroy", format!("namespace cleanup skipped: {err}"));
                    }
                    Ok(_) => {}
                }
            }
            DeploymentMode::CloudLocal | DeploymentMode::CloudHosted => {
                if IacDriver::state_present(&ws.tf_dir()) {
                    let scope = self.require_credentials(credentials.as_ref())?;
                    let runner = StreamingIacRunner {
                        progress: progress.clone(),
                        log_dir: Some(ws.logs_dir()),
                        timeout: self.config.timeouts.iac_apply,
                    };
                    let driver = IacDriver::new(
                        self.config.iac_tool,
                        &runner,
                        ws.tf_dir(),
                        scope.env_map(),
                    );
                    if let Err(err) = driver.destroy().await {
                        // Workspace retained for manual inspection; marked so
                        // the attempt is never silently forgotten.
                        meta.last_error = Some(MetaError {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                        self.set_status(&ws, &mut meta, DeploymentStatus::DecommissionAttempted)?;
                        return Err(err);
                    }
                }
            }
        }

        ws.clear_state_marker()?;
        self.store.release(id, false)?;
        self.registry.set(id, DeploymentStatus::Decommissioned);
        progress.stage_end("iac-destroy", format!("deployment '{id}' decommissioned"));
        Ok(DeploymentOutcome::ok(
            id,
            DeploymentStatus::Decommissioned,
            Vec::new(),
            IndexMap::new(),
        ))
    }

    // ----- shared helpers -----

    fn require_credentials<'a>(
        &'a self,
        supplied: Option<&'a CredentialScope>,
    ) -> Result<CredentialScope> {
        supplied
            .or(self.config.default_credentials.as_ref())
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Credential(
                    "cloud credentials are required for this deployment mode".to_string(),
                )
            })
    }

    fn ssh_target(&self, ws: &Workspace, meta: &DeploymentMeta) -> Result<SshTarget> {
        let _ = ws;
        let key_name = meta.key_name.as_deref().ok_or_else(|| {
            OrchestratorError::Config(format!("deployment '{}' has no recorded key name", meta.id))
        })?;
        let key_path = self.config.ssh_key_path(key_name)?;
        let host = meta.outputs.get("public_ip").cloned().ok_or_else(|| {
            OrchestratorError::Config(format!(
                "deployment '{}' has no recorded public_ip output",
                meta.id
            ))
        })?;
        Ok(SshTarget::new(host, key_path))
    }

    fn kube_target(&self, ws: &Workspace, meta: &DeploymentMeta) -> Result<KubeTarget> {
        match meta.mode {
            DeploymentMode::Local => Ok(KubeTarget::kind_cluster()),
            DeploymentMode::CloudLocal => Ok(KubeTarget::Remote(self.ssh_target(ws, meta)?)),
            DeploymentMode::CloudHosted => {
                let kubeconfig = ws.tf_dir().join("kubeconfig");
                if !kubeconfig.is_file() {
                    return Err(OrchestratorError::Config(format!(
                        "deployment '{}' has no kubeconfig on disk; deploy it again first",
                        meta.id
                    )));
                }
                Ok(KubeTarget::kubeconfig(kubeconfig))
            }
        }
    }

    fn set_status(
        &self,
        ws: &Workspace,
        meta: &mut DeploymentMeta,
        status: DeploymentStatus,
    ) -> Result<()> {
        meta.status = status;
        meta.touch();
        ws.save_meta(meta)?;
        self.registry.set(&meta.id, status);
        Ok(())
    }

    fn mark_timed_out(&self, id: &str) {
        let Ok(ws) = self.store.locate(id) else { return };
        let Ok(mut meta) = ws.load_meta() else { return };
        if matches!(
            meta.status,
            DeploymentStatus::Running | DeploymentStatus::Decommissioning
        ) {
            meta.last_error = Some(MetaError {
                kind: "PipelineTimeout".to_string(),
                message: format!(
                    "pipeline exceeded its {}s budget",
                    self.config.timeouts.pipeline_total.as_secs()
                ),
            });
            meta.status = DeploymentStatus::Failed;
            meta.touch();
            let _ = ws.save_meta(&meta);
            self.registry.set(id, DeploymentStatus::Failed);
        }
    }

    fn record_failure(&self, ws: &Workspace, meta: &mut DeploymentMeta, err: &OrchestratorError) {
        meta.status = DeploymentStatus::Failed;
        meta.last_error = Some(MetaError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        meta.touch();
        let _ = ws.save_meta(meta);
        self.registry.set(&meta.id, DeploymentStatus::Failed);
    }
}

fn require_output(outputs: &IndexMap<String, String>, key: &str) -> Result<String> {
    outputs.get(key).cloned().ok_or_else(|| {
        OrchestratorError::Template(format!("IaC outputs are missing required key '{key}'"))
    })
}

fn short(commit: &str) -> &str {
    if commit.len() >= 8 { &commit[..8] } else { commit }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_statuses() {
        let registry = ActiveRegistry::default();
        assert_eq!(registry.status("a"), None);
        registry.set("a", DeploymentStatus::Running);
        assert_eq!(registry.status("a"), Some(DeploymentStatus::Running));
        registry.remove("a");
        assert_eq!(registry.status("a"), None);
    }

    #[test]
    fn outcome_serializes_kebab_case_status() {
        let outcome = DeploymentOutcome::ok(
            "app-1",
            DeploymentStatus::Decommissioned,
            vec!["http://localhost:30080".to_string()],
            IndexMap::new(),
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "decommissioned");
        assert_eq!(json["deployment_id"], "app-1");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn missing_output_names_the_key() {
        let err = require_output(&IndexMap::new(), "public_ip").unwrap_err();
        assert!(format!("{err}").contains("public_ip"));
    }

    #[test]
    fn short_commit_is_truncated() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
