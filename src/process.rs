use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressSender;

const DEFAULT_TAIL_LINES: usize = 40;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Description of one external binary invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub stage: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub stdin_data: Option<Vec<u8>>,
    pub log_path: Option<PathBuf>,
    pub tail_limit: usize,
    pub quiet: bool,
}

impl CommandSpec {
    pub fn new(stage: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(600),
            stdin_data: None,
            log_path: None,
            tail_limit: DEFAULT_TAIL_LINES,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, entries: &[(String, String)]) -> Self {
        self.env.extend(entries.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn tail_limit(mut self, limit: usize) -> Self {
        self.tail_limit = limit;
        self
    }

    /// Keep output out of the chat stream (still written to the stage log).
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Exit code plus the last lines of combined output.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stage: String,
    pub program: String,
    pub status: Option<i32>,
    pub tail: Vec<String>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }

    /// Nonzero exit is not an error at the runner layer; callers that do
    /// treat it as fatal convert through here.
    pub fn success_or_exit_error(self) -> Result<CommandOutcome> {
        if self.success() {
            Ok(self)
        } else {
            Err(OrchestratorError::SubprocessExit {
                program: self.program.clone(),
                stage: self.stage.clone(),
                code: self.status,
                tail: self.tail_text(),
            })
        }
    }
}

/// Run an external binary, forwarding each output line (stdout and stderr
/// interleaved by arrival) as a progress event. On timeout the child is
/// killed and reaped within a bounded grace window; kill-on-drop backstops
/// descriptor cleanup on cancellation.
pub async fn run_streaming(spec: CommandSpec, progress: &ProgressSender) -> Result<CommandOutcome> {
    let resolved = which::which(&spec.program).map_err(|err| OrchestratorError::SubprocessLaunch {
        binary: spec.program.clone(),
        reason: err.to_string(),
    })?;

    let mut command = Command::new(&resolved);
    command
        .args(&spec.args)
        .stdin(if spec.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    debug!(stage = %spec.stage, program = %spec.program, args = ?spec.args, "spawning");
    let mut child = command
        .spawn()
        .map_err(|err| OrchestratorError::SubprocessLaunch {
            binary: spec.program.clone(),
            reason: err.to_string(),
        })?;

    if let Some(data) = &spec.stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut log_file = match &spec.log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            )
        }
        None => None,
    };

    let deadline = Instant::now() + spec.timeout;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(spec.tail_limit.min(256));

    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !spec.quiet {
                        progress.line(&spec.stage, line.clone());
                    }
                    if let Some(file) = log_file.as_mut() {
                        let _ = writeln!(file, "{line}");
                    }
                    if tail.len() == spec.tail_limit {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                kill_with_grace(&mut child).await;
                let mut lines: Vec<String> = tail.into();
                lines.push(format!(
                    "timed out after {}s",
                    spec.timeout.as_secs()
                ));
                return Err(OrchestratorError::SubprocessExit {
                    program: spec.program,
                    stage: spec.stage,
                    code: None,
                    tail: lines.join("\n"),
                });
            }
        }
    }

    // Output is closed; the exit status should follow promptly even when
    // the deadline was shaved close.
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_secs(5));
    let status = match timeout(remaining, child.wait()).await {
        Ok(result) => result?,
        Err(_) => {
            kill_with_grace(&mut child).await;
            return Err(OrchestratorError::SubprocessExit {
                program: spec.program,
                stage: spec.stage,
                code: None,
                tail: format!("timed out after {}s", spec.timeout.as_secs()),
            });
        }
    };

    Ok(CommandOutcome {
        stage: spec.stage,
        program: spec.program,
        status: status.code(),
        tail: tail.into(),
    })
}

async fn kill_with_grace(child: &mut Child) {
    let _ = child.start_kill();
    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let (sender, _rx) = progress::channel();
        let spec = CommandSpec::new("clone", "definitely-not-a-real-binary-xyz");
        let err = run_streaming(spec, &sender).await.unwrap_err();
        assert_eq!(err.kind(), "SubprocessLaunchError");
    }

    #[tokio::test]
    async fn captures_tail_and_exit_code() {
        let (sender, mut rx) = progress::channel();
        let spec = CommandSpec::new("echo", "sh")
            .arg("-c")
            .arg("echo one; echo two");
        let outcome = run_streaming(spec, &sender).await.expect("runs");
        assert!(outcome.success());
        assert_eq!(outcome.tail, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(rx.recv().await.unwrap().message, "one");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error_until_converted() {
        let (sender, _rx) = progress::channel();
        let spec = CommandSpec::new("fail", "sh").arg("-c").arg("echo boom; exit 3");
        let outcome = run_streaming(spec, &sender).await.expect("runs");
        assert_eq!(outcome.status, Some(3));
        let err = outcome.success_or_exit_error().unwrap_err();
        match err {
            OrchestratorError::SubprocessExit { code, tail, .. } => {
                assert_eq!(code, Some(3));
                assert!(tail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (sender, _rx) = progress::channel();
        let spec = CommandSpec::new("sleep", "sh")
            .arg("-c")
            .arg("sleep 30")
            .timeout(Duration::from_millis(200));
        let err = run_streaming(spec, &sender).await.unwrap_err();
        match err {
            OrchestratorError::SubprocessExit { code, tail, .. } => {
                assert_eq!(code, None);
                assert!(tail.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn tail_is_bounded() {
        let (sender, _rx) = progress::channel();
        let spec = CommandSpec::new("many", "sh")
            .arg("-c")
            .arg("for i in $(seq 1 100); do echo line-$i; done")
            .tail_limit(5)
            .quiet();
        let outcome = run_streaming(spec, &sender).await.expect("runs");
        assert_eq!(outcome.tail.len(), 5);
        assert_eq!(outcome.tail.last().unwrap(), "line-100");
    }
}
