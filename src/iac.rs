use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::process::{CommandOutcome, CommandSpec, run_streaming};
use crate::progress::ProgressSender;

const PLAN_FILE: &str = "plan.tfplan";
const TFVARS_FILE: &str = "terraform.tfvars.json";
const STATE_FILE: &str = "terraform.tfstate";

/// Supported IaC tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IacTool {
    Terraform,
    OpenTofu,
}

impl fmt::Display for IacTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

impl IacTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            IacTool::Terraform => "terraform",
            IacTool::OpenTofu => "tofu",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "terraform" | "tf" => Some(IacTool::Terraform),
            "opentofu" | "tofu" => Some(IacTool::OpenTofu),
            _ => None,
        }
    }
}

/// Pick the IaC tool from the `IAC_TOOL` override or PATH auto-detection
/// (tofu takes precedence).
pub fn resolve_iac_tool(env_override: Option<String>) -> Result<IacTool> {
    if let Some(env) = env_override {
        if let Some(tool) = IacTool::from_name(&env) {
            return Ok(tool);
        }
        return Err(OrchestratorError::Config(format!(
            "invalid IaC tool '{env}' set via IAC_TOOL"
        )));
    }
    if which::which("tofu").is_ok() {
        return Ok(IacTool::OpenTofu);
    }
    if which::which("terraform").is_ok() {
        return Ok(IacTool::Terraform);
    }
    warn!("no terraform/tofu binary found on PATH; defaulting to terraform");
    Ok(IacTool::Terraform)
}

/// Resource counts reported by `plan`, consumed by apply gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    pub added: usize,
    pub changed: usize,
    pub destroyed: usize,
    pub has_changes: bool,
    pub summary: String,
}

impl PlanResult {
    pub fn no_op() -> Self {
        Self {
            added: 0,
            changed: 0,
            destroyed: 0,
            has_changes: false,
            summary: "No changes.".to_string(),
        }
    }
}

/// Seam for executing IaC commands; mocked in tests.
#[async_trait]
pub trait IacCommandRunner: Send + Sync {
    async fn run(
        &self,
        tool: IacTool,
        dir: &Path,
        stage: &str,
        args: &[String],
        env: &[(String, String)],
        quiet: bool,
    ) -> Result<CommandOutcome>;
}

/// Production runner: streams every line to the progress channel and the
/// per-stage log file.
pub struct StreamingIacRunner {
    pub progress: ProgressSender,
    pub log_dir: Option<PathBuf>,
    pub timeout: Duration,
}

#[async_trait]
impl IacCommandRunner for StreamingIacRunner {
    async fn run(
        &self,
        tool: IacTool,
        dir: &Path,
        stage: &str,
        args: &[String],
        env: &[(String, String)],
        quiet: bool,
    ) -> Result<CommandOutcome> {
        let mut spec = CommandSpec::new(stage, tool.binary_name())
            .args(args.iter().cloned())
            .cwd(dir)
            .envs(env)
            .timeout(self.timeout);
        if let Some(log_dir) = &self.log_dir {
            spec = spec.log_to(log_dir.join(format!("{stage}.log")));
        }
        if quiet {
            spec = spec.quiet().tail_limit(4096);
        }
        run_streaming(spec, &self.progress).await
    }
}

/// Wraps one workspace's `tf/` directory with the
/// init / plan / apply / output / destroy sequence. State is local to the
/// directory; there is no remote backend.
pub struct IacDriver<'a> {
    tool: IacTool,
    runner: &'a dyn IacCommandRunner,
    tf_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl<'a> IacDriver<'a> {
    pub fn new(
        tool: IacTool,
        runner: &'a dyn IacCommandRunner,
        tf_dir: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            tool,
            runner,
            tf_dir: tf_dir.into(),
            env,
        }
    }

    pub fn state_present(tf_dir: &Path) -> bool {
        tf_dir.join(STATE_FILE).is_file()
    }

    pub async fn init(&self) -> Result<()> {
        self.run("iac-init", &["init", "-input=false"], false)
            .await?
            .success_or_exit_error()?;
        Ok(())
    }

    /// Write the variable bag (merged over any prior one so later applies
    /// and destroy see the full set) and produce a plan file.
    pub async fn plan(&self, vars: &BTreeMap<String, String>) -> Result<PlanResult> {
        self.merge_tfvars(vars)?;
        let outcome = self
            .run(
                "iac-plan",
                &[
                    "plan",
                    "-input=false",
                    "-detailed-exitcode",
                    &format!("-out={PLAN_FILE}"),
                ],
                false,
            )
            .await?;
        match outcome.status {
            Some(0) => Ok(PlanResult::no_op()),
            Some(2) => Ok(parse_plan_counts(&outcome.tail)),
            _ => Err(OrchestratorError::SubprocessExit {
                program: self.tool.binary_name().to_string(),
                stage: "iac-plan".to_string(),
                code: outcome.status,
                tail: outcome.tail_text(),
            }),
        }
    }

    pub async fn apply(&self) -> Result<IndexMap<String, String>> {
        self.run(
            "iac-apply",
            &["apply", "-input=false", "-auto-approve", PLAN_FILE],
            false,
        )
        .await?
        .success_or_exit_error()?;
        self.outputs().await
    }

    /// Structured outputs of the current state, for fresh and resumed
    /// deployments alike.
    pub async fn outputs(&self) -> Result<IndexMap<String, String>> {
        let outcome = self
            .run("iac-output", &["output", "-json"], true)
            .await?
            .success_or_exit_error()?;
        parse_outputs(&outcome.tail_text())
    }

    pub async fn destroy(&self) -> Result<()> {
        let outcome = self
            .run("iac-destroy", &["destroy", "-input=false", "-auto-approve"], false)
            .await?;
        if !outcome.success() {
            return Err(OrchestratorError::Decommission(format!(
                "{} destroy failed (exit {:?}): {}",
                self.tool,
                outcome.status,
                outcome.tail_text()
            )));
        }
        Ok(())
    }

    async fn run(&self, stage: &str, args: &[&str], quiet: bool) -> Result<CommandOutcome> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner
            .run(self.tool, &self.tf_dir, stage, &args, &self.env, quiet)
            .await
    }

    fn merge_tfvars(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        let path = self.tf_dir.join(TFVARS_FILE);
        let mut merged: serde_json::Map<String, Value> = match fs::read_to_string(&path) {
            Ok(existing) => serde_json::from_str(&existing).unwrap_or_default(),
            Err(_) => serde_json::Map::new(),
        };
        for (key, value) in vars {
            merged.insert(key.clone(), Value::String(value.clone()));
        }
        fs::write(&path, serde_json::to_string_pretty(&Value::Object(merged))?)?;
        Ok(())
    }
}

fn parse_outputs(raw: &str) -> Result<IndexMap<String, String>> {
    let parsed: Value = serde_json::from_str(raw.trim()).map_err(|err| {
        OrchestratorError::Template(format!("unreadable IaC output payload: {err}"))
    })?;
    let mut bag = IndexMap::new();
    if let Value::Object(map) = parsed {
        for (key, entry) in map {
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            bag.insert(key, rendered);
        }
    }
    Ok(bag)
}

fn parse_plan_counts(lines: &[String]) -> PlanResult {
    let mut result = PlanResult {
        added: 0,
        changed: 0,
        destroyed: 0,
        has_changes: true,
        summary: String::new(),
    };
    for line in lines.iter().rev() {
        if let Some(idx) = line.find("Plan:") {
            let summary = line[idx..].trim().to_string();
            let tokens: Vec<&str> = summary.split_whitespace().collect();
            for i in 0..tokens.len() {
                if let Ok(count) = tokens[i].parse::<usize>() {
                    if tokens.get(i + 1) == Some(&"to") {
                        match tokens.get(i + 2).map(|t| t.trim_end_matches(|c| c == ',' || c == '.')) {
                            Some("add") => result.added = count,
                            Some("change") => result.changed = count,
                            Some("destroy") => result.destroyed = count,
                            _ => {}
                        }
                    }
                }
            }
            result.summary = summary;
            return result;
        }
    }
    result.summary = "changes detected".to_string();
    result
}
