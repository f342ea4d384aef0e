use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::DeploymentMode;
use crate::error::{OrchestratorError, Result};

/// Lifecycle state of a deployment, persisted in `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Decommissioning,
    Decommissioned,
    DecommissionAttempted,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Decommissioning => "decommissioning",
            DeploymentStatus::Decommissioned => "decommissioned",
            DeploymentStatus::DecommissionAttempted => "decommission-attempted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded
                | DeploymentStatus::Failed
                | DeploymentStatus::Decommissioned
                | DeploymentStatus::DecommissionAttempted
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaError {
    pub kind: String,
    pub message: String,
}

/// Authoritative per-deployment record. Unknown fields are ignored on load
/// so newer writers stay readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub id: String,
    pub mode: DeploymentMode,
    pub status: DeploymentStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub last_error: Option<MetaError>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_replicas() -> u32 {
    1
}

impl DeploymentMeta {
    pub fn new(id: &str, mode: DeploymentMode) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.to_string(),
            mode,
            status: DeploymentStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            repo_url: None,
            namespace: default_namespace(),
            replicas: default_replicas(),
            image_ref: None,
            outputs: IndexMap::new(),
            domain: None,
            key_name: None,
            last_error: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// On-disk directory holding all state for one deployment.
#[derive(Debug, Clone)]
pub struct Workspace {
    id: String,
    root: PathBuf,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn tf_dir(&self) -> PathBuf {
        self.root.join("tf")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn stage_log(&self, stage: &str) -> PathBuf {
        self.logs_dir().join(format!("{stage}.log"))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn load_meta(&self) -> Result<DeploymentMeta> {
        let data = fs::read_to_string(self.meta_path())?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save_meta(&self, meta: &DeploymentMeta) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        fs::write(self.meta_path(), json)?;
        Ok(())
    }

    /// Marker consulted by `release`: present while IaC state may own live
    /// cloud resources.
    pub fn mark_state_exists(&self) -> Result<()> {
        fs::create_dir_all(self.tf_dir())?;
        fs::write(self.state_marker(), b"")?;
        Ok(())
    }

    pub fn clear_state_marker(&self) -> Result<()> {
        let marker = self.state_marker();
        if marker.exists() {
            fs::remove_file(marker)?;
        }
        Ok(())
    }

    pub fn has_live_state(&self) -> bool {
        self.state_marker().exists()
    }

    fn state_marker(&self) -> PathBuf {
        self.tf_dir().join("state.exists")
    }
}

/// Allocates, locates and reclaims per-deployment directories under a
/// configured base path.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    base: PathBuf,
}

impl WorkspaceStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn allocate(&self, id: &str) -> Result<Workspace> {
        validate_id(id)?;
        let root = self.base.join(id);
        if root.exists() {
            return Err(OrchestratorError::Validation(format!(
                "a workspace for deployment '{id}' already exists"
            )));
        }
        let workspace = Workspace {
            id: id.to_string(),
            root,
        };
        // tf/ and manifests/ appear once a pipeline first writes into them.
        fs::create_dir_all(workspace.source_dir())?;
        fs::create_dir_all(workspace.logs_dir())?;
        Ok(workspace)
    }

    pub fn locate(&self, id: &str) -> Result<Workspace> {
        validate_id(id)?;
        let root = self.base.join(id);
        if !root.is_dir() {
            return Err(OrchestratorError::Validation(format!(
                "no workspace for deployment '{id}'"
            )));
        }
        Ok(Workspace {
            id: id.to_string(),
            root,
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.base.join(id).is_dir()
    }

    /// Recursive delete. Refuses while `tf/state.exists` is present unless
    /// `force` is asserted, so undestroyed cloud resources keep their state.
    pub fn release(&self, id: &str, force: bool) -> Result<()> {
        let workspace = self.locate(id)?;
        if workspace.has_live_state() && !force {
            return Err(OrchestratorError::Validation(format!(
                "workspace '{id}' still tracks live infrastructure; decommission it first or force"
            )));
        }
        fs::remove_dir_all(workspace.root())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.base.is_dir() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.path().join("meta.json").is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// One guard per deployment id, process-wide. Holding it is what makes a
/// pipeline the sole mutator of its workspace.
pub type DeploymentLock = OwnedMutexGuard<()>;

static LOCKS: Lazy<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

pub fn lock_deployment(id: &str) -> Result<DeploymentLock> {
    let mutex = {
        let mut table = LOCKS.lock().expect("lock table poisoned");
        table
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    };
    mutex.try_lock_owned().map_err(|_| {
        OrchestratorError::Validation(format!(
            "deployment '{id}' already has a pipeline running"
        ))
    })
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        return Err(OrchestratorError::Validation(format!(
            "deployment id '{id}' must be 1-63 characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(OrchestratorError::Validation(format!(
            "deployment id '{id}' may only contain lowercase letters, digits and dashes"
        )));
    }
    Ok(())
}
