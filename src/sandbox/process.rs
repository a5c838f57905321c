//! Bounded execution of one external command.

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::capture::{read_bounded, CapturedStream};
use super::registry::ProcessRegistry;
use super::terminate::{kill_group_now, terminate_process_tree};
use crate::error::SandboxError;

/// Argument placeholder replaced by the staged input file path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Longest label kept in a staged file name; the rest is dropped so long
/// problem ids stay well under the file name limit.
const MAX_LABEL_CHARS: usize = 64;

/// Configuration shared by every run of a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Time between SIGTERM and SIGKILL when tearing a group down.
    pub grace_period: Duration,
    /// Maximum bytes retained per output stream.
    pub max_output_bytes: usize,
}

impl SandboxConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Sets the grace interval.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the per-stream capture limit.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Text written to a temp file inside the working directory before spawn.
#[derive(Debug, Clone)]
pub struct StagedInput {
    /// File contents.
    pub contents: String,
    /// Identifies the run in the file name (shard, problem, attempt).
    pub label: String,
    /// File extension including the dot.
    pub suffix: String,
}

impl StagedInput {
    /// Creates a staged input.
    pub fn new(
        contents: impl Into<String>,
        label: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            contents: contents.into(),
            label: label.into(),
            suffix: suffix.into(),
        }
    }

    fn file_prefix(&self) -> String {
        let clean: String = self
            .label
            .chars()
            .take(MAX_LABEL_CHARS)
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("pe_{}_", clean)
    }
}

/// One command to run under the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments; [`INPUT_PLACEHOLDER`] is substituted.
    pub args: Vec<String>,
    /// Working directory, also where the staged input is written.
    pub working_dir: PathBuf,
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Optional input file staged for the run.
    pub input: Option<StagedInput>,
}

impl SandboxRequest {
    /// Creates a request with no arguments and no input.
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout,
            input: None,
        }
    }

    /// Sets the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Stages an input file for the run.
    pub fn with_input(mut self, input: StagedInput) -> Self {
        self.input = Some(input);
        self
    }

    fn label(&self) -> String {
        self.input
            .as_ref()
            .map(|i| i.label.clone())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The process exited on its own.
    Exited,
    /// The wall-clock timeout expired and the group was torn down.
    TimedOut,
    /// The owning registry was cancelled and the group was torn down.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Exited => write!(f, "exited"),
            TerminationReason::TimedOut => write!(f, "timed_out"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a sandboxed run.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    /// Captured stdout (bounded).
    pub stdout: String,
    /// Captured stderr (bounded).
    pub stderr: String,
    /// Exit code, absent when killed by a signal or never spawned.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Why the run ended.
    pub termination: TerminationReason,
    /// Wall-clock time from spawn to teardown.
    pub duration: Duration,
    /// True if stdout exceeded the capture limit.
    pub stdout_truncated: bool,
    /// True if stderr exceeded the capture limit.
    pub stderr_truncated: bool,
}

impl SandboxOutput {
    fn not_started(termination: TerminationReason) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            termination,
            duration: Duration::ZERO,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    /// True if the wall-clock limit was hit.
    pub fn timed_out(&self) -> bool {
        self.termination == TerminationReason::TimedOut
    }

    /// True if the run was cancelled.
    pub fn cancelled(&self) -> bool {
        self.termination == TerminationReason::Cancelled
    }

    /// True if the process exited on its own with status 0.
    pub fn success(&self) -> bool {
        self.termination == TerminationReason::Exited && self.exit_code == Some(0)
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs external commands in their own process group under a hard timeout.
///
/// Every exit path (clean exit, non-zero exit, timeout, cancellation, the
/// run future being dropped) removes the staged input file and leaves no
/// member of the run's process group alive.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    registry: ProcessRegistry,
}

impl ProcessSandbox {
    /// Creates a sandbox bound to `registry`.
    pub fn new(config: SandboxConfig, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }

    /// The registry this sandbox reports to.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// The sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runs `request` to completion, timeout, or cancellation.
    pub async fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        if !request.working_dir.is_dir() {
            return Err(SandboxError::MissingWorkingDir(
                request.working_dir.display().to_string(),
            ));
        }
        if self.registry.is_cancelled() {
            return Ok(SandboxOutput::not_started(TerminationReason::Cancelled));
        }

        // Removed when this binding drops, on every return path below.
        let staged = match &request.input {
            Some(input) => Some(stage_input(&request.working_dir, input)?),
            None => None,
        };
        let args = substitute_input(&request.args, staged.as_ref().map(|f| f.path()));

        let mut cmd = Command::new(&request.program);
        cmd.args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Io(std::io::Error::other(
                "child exited before its pid could be read",
            )));
        };
        let pgid = pid as i32;
        let lease = self.registry.register(pgid, request.label());
        debug!(pgid, program = %request.program, "Spawned sandboxed process");

        let limit = self.config.max_output_bytes;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_bounded(s, limit)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_bounded(s, limit)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Waited::TimedOut,
            _ = self.registry.cancelled() => Waited::Cancelled,
        };

        let (status, termination) = match waited {
            Waited::Exited(status) => {
                let status = status?;
                // Sweep descendants that outlived the leader.
                if kill_group_now(pgid) {
                    debug!(pgid, "Swept leftover processes after exit");
                }
                (status, TerminationReason::Exited)
            }
            Waited::TimedOut => {
                warn!(pgid, timeout = ?request.timeout, "Sandboxed process timed out");
                let status =
                    terminate_process_tree(pgid, &mut child, self.config.grace_period).await?;
                (status, TerminationReason::TimedOut)
            }
            Waited::Cancelled => {
                info!(pgid, "Cancellation requested, terminating sandboxed process");
                let status =
                    terminate_process_tree(pgid, &mut child, self.config.grace_period).await?;
                (status, TerminationReason::Cancelled)
            }
        };
        lease.release();

        let grace = self.config.grace_period;
        let stdout = join_capture(stdout_task, grace).await;
        let stderr = join_capture(stderr_task, grace).await;
        drop(staged);

        Ok(SandboxOutput {
            stdout: stdout.text,
            stderr: stderr.text,
            exit_code: status.code(),
            signal: status.signal(),
            termination,
            duration: start.elapsed(),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        })
    }
}

fn stage_input(dir: &Path, input: &StagedInput) -> Result<NamedTempFile, SandboxError> {
    let stage_err = |source| SandboxError::Stage {
        dir: dir.display().to_string(),
        source,
    };
    let mut file = tempfile::Builder::new()
        .prefix(&input.file_prefix())
        .suffix(&input.suffix)
        .tempfile_in(dir)
        .map_err(stage_err)?;
    file.write_all(input.contents.as_bytes()).map_err(stage_err)?;
    file.flush().map_err(stage_err)?;
    Ok(file)
}

fn substitute_input(args: &[String], input: Option<&Path>) -> Vec<String> {
    match input {
        Some(path) => {
            let path = path.to_string_lossy();
            args.iter()
                .map(|a| a.replace(INPUT_PLACEHOLDER, &path))
                .collect()
        }
        None => args.to_vec(),
    }
}

/// Joins a capture task. A reader still blocked after `grace` means some
/// process escaped the group while holding the pipe; it is abandoned.
async fn join_capture(
    task: Option<JoinHandle<std::io::Result<CapturedStream>>>,
    grace: Duration,
) -> CapturedStream {
    let Some(mut task) = task else {
        return CapturedStream::default();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed reading sandbox output");
            CapturedStream::default()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Output capture task failed");
            CapturedStream::default()
        }
        Err(_) => {
            warn!("Output pipe still open after teardown, abandoning capture");
            task.abort();
            CapturedStream {
                text: String::new(),
                truncated: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> ProcessSandbox {
        ProcessSandbox::new(
            SandboxConfig::new().with_grace_period(Duration::from_millis(300)),
            ProcessRegistry::new(),
        )
    }

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("pe_"))
            .collect()
    }

    #[test]
    fn test_sandbox_config_builder() {
        let config = SandboxConfig::new()
            .with_grace_period(Duration::from_secs(1))
            .with_max_output_bytes(512);
        assert_eq!(config.grace_period, Duration::from_secs(1));
        assert_eq!(config.max_output_bytes, 512);
    }

    #[test]
    fn test_file_prefix_is_sanitized() {
        let input = StagedInput::new("", "s0/problem 7/a1", ".lean");
        assert_eq!(input.file_prefix(), "pe_s0_problem_7_a1_");
    }

    #[tokio::test]
    async fn test_long_label_still_stages() {
        let dir = TempDir::new().unwrap();
        let label = format!("s0_{}_a0", "x".repeat(400));
        let input = StagedInput::new("x", label, ".lean");
        assert_eq!(input.file_prefix().len(), "pe_".len() + MAX_LABEL_CHARS + 1);

        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(10))
            .with_args(["-c", "cat \"$1\"", "sh", "{input}"])
            .with_input(input);
        let output = sandbox().run(&request).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "x");
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[test]
    fn test_substitute_input() {
        let args = vec!["env".to_string(), "lean".to_string(), "{input}".to_string()];
        let out = substitute_input(&args, Some(Path::new("/root/p/x.lean")));
        assert_eq!(out, vec!["env", "lean", "/root/p/x.lean"]);
        assert_eq!(substitute_input(&args, None), args);
    }

    #[tokio::test]
    async fn test_run_captures_output_and_status() {
        let dir = TempDir::new().unwrap();
        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(10))
            .with_args(["-c", "cat \"$1\"; echo oops >&2; exit 3", "sh", "{input}"])
            .with_input(StagedInput::new("theorem x : True := trivial", "p1_a0", ".lean"));

        let output = sandbox().run(&request).await.unwrap();

        assert_eq!(output.termination, TerminationReason::Exited);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "theorem x : True := trivial");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_staged_file_lives_in_working_dir() {
        let dir = TempDir::new().unwrap();
        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(10))
            .with_args(["-c", "dirname \"$1\"", "sh", "{input}"])
            .with_input(StagedInput::new("x", "p1_a0", ".lean"));

        let output = sandbox().run(&request).await.unwrap();
        let reported = PathBuf::from(output.stdout.trim());

        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_timeout_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(1))
            .with_args(["-c", "sleep 5", "sh", "{input}"])
            .with_input(StagedInput::new("x", "p1_a0", ".lean"));

        let start = Instant::now();
        let output = sandbox().run(&request).await.unwrap();

        assert!(output.timed_out());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = TempDir::new().unwrap();
        let sandbox = ProcessSandbox::new(
            SandboxConfig::new().with_max_output_bytes(1000),
            ProcessRegistry::new(),
        );
        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(10))
            .with_args(["-c", "head -c 100000 /dev/zero | tr '\\0' 'a'"]);

        let output = sandbox.run(&request).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.len(), 1000);
        assert!(output.stdout_truncated);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let request = SandboxRequest::new("definitely-not-a-verifier", dir.path(), Duration::from_secs(1))
            .with_input(StagedInput::new("x", "p1_a0", ".lean"));

        let err = sandbox().run(&request).await.unwrap_err();

        assert!(matches!(err, SandboxError::Spawn { .. }));
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_registry_skips_spawn() {
        let dir = TempDir::new().unwrap();
        let sandbox = sandbox();
        sandbox.registry().cancel();
        let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(1))
            .with_args(["-c", "exit 0"]);

        let output = sandbox.run(&request).await.unwrap();
        assert!(output.cancelled());
        assert_eq!(output.exit_code, None);
    }
}
