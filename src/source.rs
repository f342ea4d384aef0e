use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::process::{CommandSpec, run_streaming};
use crate::progress::ProgressSender;
use crate::workspace::Workspace;

const DOCKERFILE_NAMES: &[&str] = &["Dockerfile", "dockerfile", "Containerfile"];
const README_NAMES: &[&str] = &["README.md", "README", "readme.md", "README.txt"];

const BUILD_PREFIXES: &[&str] = &[
    "docker build",
    "npm run build",
    "npm install",
    "yarn build",
    "make",
    "cargo build",
    "go build",
    "mvn",
    "gradle",
    "pip install",
];

const RUN_PREFIXES: &[&str] = &[
    "docker run",
    "npm start",
    "npm run start",
    "yarn start",
    "cargo run",
    "go run",
    "python",
    "node",
    "java -jar",
    "uvicorn",
    "gunicorn",
    "flask run",
    "./",
];

/// What a clone of the source repository looked like at request time.
/// Immutable within a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub repo_url: String,
    pub commit: String,
    pub has_dockerfile: bool,
    pub has_readme: bool,
    pub build_hint: Option<String>,
    pub run_hint: Option<String>,
    pub ports: Vec<u16>,
}

/// Clone the repository into `workspace/source/` and summarize it.
pub async fn fetch(
    repo_url: &str,
    workspace: &Workspace,
    progress: &ProgressSender,
    timeout: Duration,
) -> Result<SourceSnapshot> {
    let source_dir = workspace.source_dir();
    if source_dir.exists() {
        fs::remove_dir_all(&source_dir)?;
    }

    let clone = CommandSpec::new("clone", "git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(repo_url)
        .arg(source_dir.display().to_string())
        .timeout(timeout)
        .log_to(workspace.stage_log("clone"));
    let outcome = run_streaming(clone, progress).await?;
    if !outcome.success() {
        return Err(OrchestratorError::Source(format!(
            "git clone of {repo_url} failed: {}",
            outcome.tail_text()
        )));
    }

    let rev = CommandSpec::new("clone", "git")
        .arg("-C")
        .arg(source_dir.display().to_string())
        .arg("rev-parse")
        .arg("HEAD")
        .timeout(Duration::from_secs(30))
        .quiet();
    let rev_outcome = run_streaming(rev, progress).await?.success_or_exit_error()?;
    let commit = rev_outcome
        .tail
        .first()
        .map(|line| line.trim().to_string())
        .unwrap_or_default();

    let snapshot = inspect(&source_dir, repo_url, commit);
    if !snapshot.has_dockerfile {
        progress.warning(
            "clone",
            format!("{repo_url} has no container build recipe at its root"),
        );
    }
    debug!(?snapshot.ports, build = ?snapshot.build_hint, run = ?snapshot.run_hint, "source inspected");
    Ok(snapshot)
}

/// Single-pass heuristic summary of a checked-out repository root.
pub fn inspect(source_dir: &Path, repo_url: &str, commit: String) -> SourceSnapshot {
    let has_dockerfile = DOCKERFILE_NAMES
        .iter()
        .any(|name| source_dir.join(name).is_file());

    let mut ports = Vec::new();
    for name in DOCKERFILE_NAMES {
        let path = source_dir.join(name);
        if let Ok(text) = fs::read_to_string(&path) {
            for line in text.lines() {
                if let Some(rest) = line.trim().strip_prefix("EXPOSE") {
                    for token in rest.split_whitespace() {
                        let token = token.split('/').next().unwrap_or(token);
                        if let Ok(port) = token.parse::<u16>() {
                            push_port(&mut ports, port);
                        }
                    }
                }
            }
            break;
        }
    }

    let readme = README_NAMES
        .iter()
        .map(|name| source_dir.join(name))
        .find(|path| path.is_file());
    let has_readme = readme.is_some();

    let mut build_hint = None;
    let mut run_hint = None;
    if let Some(path) = &readme {
        if let Ok(text) = fs::read_to_string(path) {
            for raw in text.lines() {
                let line = raw
                    .trim()
                    .trim_start_matches("$ ")
                    .trim_start_matches("> ")
                    .trim();
                if build_hint.is_none()
                    && BUILD_PREFIXES.iter().any(|p| line.starts_with(p))
                {
                    build_hint = Some(line.to_string());
                }
                if run_hint.is_none() && RUN_PREFIXES.iter().any(|p| line.starts_with(p)) {
                    run_hint = Some(line.to_string());
                }
                let lowered = line.to_ascii_lowercase();
                if lowered.contains("port") || lowered.contains("localhost:") {
                    for port in numbers_in(line) {
                        push_port(&mut ports, port);
                    }
                }
            }
        }
    }

    if ports.is_empty() {
        ports.push(8080);
    }

    SourceSnapshot {
        repo_url: repo_url.to_string(),
        commit,
        has_dockerfile,
        has_readme,
        build_hint,
        run_hint,
        ports,
    }
}

fn push_port(ports: &mut Vec<u16>, port: u16) {
    if port >= 80 && !ports.contains(&port) {
        ports.push(port);
    }
}

fn numbers_in(line: &str) -> Vec<u16> {
    let mut found = Vec::new();
    let mut current = String::new();
    for c in line.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            if (2..=5).contains(&current.len()) {
                if let Ok(value) = current.parse::<u16>() {
                    found.push(value);
                }
            }
            current.clear();
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_dockerfile_and_expose_ports() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\nEXPOSE 3000 9090/tcp\n").unwrap();
        let snapshot = inspect(dir.path(), "https://example.com/r.git", "abc".into());
        assert!(snapshot.has_dockerfile);
        assert!(!snapshot.has_readme);
        assert_eq!(snapshot.ports, vec![3000, 9090]);
    }

    #[test]
    fn extracts_hints_and_readme_ports() {
        let dir = tempdir().expect("temp dir");
        fs::write(
            dir.path().join("README.md"),
            "# App\n\n```\n$ npm install\n$ npm start\n```\nListens on port 4000.\n",
        )
        .unwrap();
        let snapshot = inspect(dir.path(), "https://example.com/r.git", "abc".into());
        assert!(snapshot.has_readme);
        assert!(!snapshot.has_dockerfile);
        assert_eq!(snapshot.build_hint.as_deref(), Some("npm install"));
        assert_eq!(snapshot.run_hint.as_deref(), Some("npm start"));
        assert_eq!(snapshot.ports, vec![4000]);
    }

    #[test]
    fn defaults_to_8080_when_nothing_found() {
        let dir = tempdir().expect("temp dir");
        let snapshot = inspect(dir.path(), "https://example.com/r.git", String::new());
        assert_eq!(snapshot.ports, vec![8080]);
        assert!(snapshot.build_hint.is_none());
    }

    #[test]
    fn ignores_tiny_and_huge_numbers_near_port_keyword() {
        let dir = tempdir().expect("temp dir");
        fs::write(
            dir.path().join("README.md"),
            "port 5 is invalid, port 123456 overflows, port 8081 works\n",
        )
        .unwrap();
        let snapshot = inspect(dir.path(), "u", String::new());
        assert_eq!(snapshot.ports, vec![8081]);
    }
}
