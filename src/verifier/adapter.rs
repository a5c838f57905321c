//! Verification adapter: unit text in, classified outcome out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::diagnostics::{DiagnosticMatcher, RegexDiagnosticMatcher};
use super::outcome::VerificationOutcome;
use crate::error::{EvalError, SandboxError};
use crate::sandbox::{ProcessSandbox, SandboxOutput, SandboxRequest, StagedInput};

/// Files that mark a directory as a Lean project root.
pub const PROJECT_MANIFESTS: &[&str] = &["lakefile.lean", "lakefile.toml", "lean-toolchain"];

/// Exit-0 output that still means the goal was not discharged.
pub const DEFAULT_REJECT_MARKERS: &[&str] = &["declaration uses 'sorry'"];

const DETAIL_TAIL_CHARS: usize = 1000;

/// External verifier invocation. `{input}` in `args` is replaced by the staged
/// unit path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl VerifierCommand {
    /// Creates a command from a program and its argument template.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a whitespace-separated command line such as `lake env lean {input}`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

impl Default for VerifierCommand {
    fn default() -> Self {
        Self::new("lake", ["env", "lean", "{input}"])
    }
}

impl std::fmt::Display for VerifierCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Verifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub command: VerifierCommand,
    /// Project root; the verifier runs here and units are staged here.
    pub project_root: PathBuf,
    pub timeout: Duration,
    /// Extension of staged units.
    pub file_suffix: String,
    pub reject_markers: Vec<String>,
    /// Require a Lean manifest in `project_root`.
    pub require_manifest: bool,
}

impl VerifierConfig {
    /// Creates a configuration for `project_root` with defaults.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            command: VerifierCommand::default(),
            project_root: project_root.into(),
            timeout: Duration::from_secs(120),
            file_suffix: ".lean".to_string(),
            reject_markers: DEFAULT_REJECT_MARKERS.iter().map(|s| s.to_string()).collect(),
            require_manifest: true,
        }
    }

    /// Sets the command template.
    pub fn with_command(mut self, command: VerifierCommand) -> Self {
        self.command = command;
        self
    }

    /// Sets the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets markers that fail an otherwise clean run.
    pub fn with_reject_markers(mut self, markers: Vec<String>) -> Self {
        self.reject_markers = markers;
        self
    }

    /// Requires a build manifest in the project root.
    pub fn with_require_manifest(mut self, require: bool) -> Self {
        self.require_manifest = require;
        self
    }
}

/// Verification failures that are not attempt outcomes.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The run was cancelled; nothing may be recorded for it.
    #[error("Verification cancelled")]
    Cancelled,

    /// The verifier cannot be run at all in this setup.
    #[error("Verifier unusable: {0}")]
    Fatal(String),
}

impl From<VerifyError> for EvalError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Cancelled => EvalError::Cancelled,
            VerifyError::Fatal(msg) => EvalError::SandboxFatal(msg),
        }
    }
}

impl From<SandboxError> for VerifyError {
    fn from(err: SandboxError) -> Self {
        VerifyError::Fatal(err.to_string())
    }
}

/// Runs units through the external verifier inside the process sandbox.
#[derive(Debug, Clone)]
pub struct Verifier {
    sandbox: ProcessSandbox,
    config: VerifierConfig,
    matcher: Arc<dyn DiagnosticMatcher>,
}

impl Verifier {
    /// Creates a verifier with the default Lean diagnostic matcher.
    pub fn new(sandbox: ProcessSandbox, config: VerifierConfig) -> Self {
        Self {
            sandbox,
            config,
            matcher: Arc::new(RegexDiagnosticMatcher::lean_default()),
        }
    }

    /// Replaces the diagnostic predicate.
    pub fn with_matcher(mut self, matcher: Arc<dyn DiagnosticMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// The verifier configuration.
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// The sandbox runs go through.
    pub fn sandbox(&self) -> &ProcessSandbox {
        &self.sandbox
    }

    /// Checks that the project root can host verifier runs.
    pub fn check_project(&self) -> Result<(), EvalError> {
        let root = &self.config.project_root;
        if !root.is_dir() {
            return Err(EvalError::SandboxFatal(format!(
                "verifier project root {} does not exist or is not a directory",
                root.display()
            )));
        }
        if self.config.require_manifest
            && !PROJECT_MANIFESTS.iter().any(|m| root.join(m).is_file())
        {
            return Err(EvalError::SandboxFatal(format!(
                "{} is not a verifier project (none of {} found)",
                root.display(),
                PROJECT_MANIFESTS.join(", ")
            )));
        }
        debug!(root = %root.display(), "Verifier project root looks usable");
        Ok(())
    }

    /// Runs `<program> --version` in the project root and returns its first
    /// output line. Only a failure to spawn is an error.
    pub async fn probe_program(&self) -> Result<String, EvalError> {
        let request = SandboxRequest::new(
            self.config.command.program.clone(),
            self.config.project_root.clone(),
            Duration::from_secs(30),
        )
        .with_args(["--version"]);
        let output = self
            .sandbox
            .run(&request)
            .await
            .map_err(|e| EvalError::from(VerifyError::from(e)))?;
        let text = if output.stdout.trim().is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(text.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Verifies `unit` with the configured project root and timeout.
    pub async fn verify(&self, unit: &str, label: &str) -> Result<VerificationOutcome, VerifyError> {
        self.verify_with(unit, &self.config.project_root, self.config.timeout, label)
            .await
    }

    /// Verifies `unit` under an explicit project root and timeout.
    pub async fn verify_with(
        &self,
        unit: &str,
        project_root: &Path,
        timeout: Duration,
        label: &str,
    ) -> Result<VerificationOutcome, VerifyError> {
        let request = SandboxRequest::new(
            self.config.command.program.clone(),
            project_root,
            timeout,
        )
        .with_args(self.config.command.args.iter().cloned())
        .with_input(StagedInput::new(unit, label, self.config.file_suffix.clone()));

        let output = self.sandbox.run(&request).await?;
        if output.cancelled() {
            info!(label, "Verification cancelled");
            return Err(VerifyError::Cancelled);
        }
        if output.stdout_truncated || output.stderr_truncated {
            warn!(label, "Verifier output exceeded the capture limit");
        }

        let outcome = classify(&output, self.matcher.as_ref(), &self.config.reject_markers);
        debug!(
            label,
            outcome = %outcome.kind(),
            exit_code = ?output.exit_code,
            duration_ms = output.duration.as_millis() as u64,
            "Verification finished"
        );
        Ok(outcome)
    }
}

/// Maps a finished sandbox run to an outcome.
///
/// Timeout wins over any output. A failing exit is `VerifierError` when the
/// matcher recognizes a diagnostic and `IncorrectNoDiagnostic` otherwise. An
/// exit-0 run whose output contains a reject marker is `VerifierError`.
pub fn classify(
    output: &SandboxOutput,
    matcher: &dyn DiagnosticMatcher,
    reject_markers: &[String],
) -> VerificationOutcome {
    if output.timed_out() {
        return VerificationOutcome::Timeout;
    }

    if !output.success() {
        if let Some(diagnostic) = matcher.find_diagnostic(&output.stdout, &output.stderr) {
            return VerificationOutcome::VerifierError { diagnostic };
        }
        return VerificationOutcome::IncorrectNoDiagnostic {
            detail: failure_detail(output),
        };
    }

    for marker in reject_markers.iter().filter(|m| !m.is_empty()) {
        let hit = [&output.stdout, &output.stderr]
            .into_iter()
            .flat_map(|s| s.lines())
            .find(|line| line.contains(marker.as_str()));
        if let Some(line) = hit {
            return VerificationOutcome::VerifierError {
                diagnostic: line.trim().to_string(),
            };
        }
    }

    VerificationOutcome::Success
}

fn failure_detail(output: &SandboxOutput) -> String {
    let status = match (output.exit_code, output.signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(sig)) => format!("killed by signal {}", sig),
        (None, None) => "no exit status".to_string(),
    };
    let combined = format!("{}{}", output.stderr, output.stdout);
    let tail = tail_chars(combined.trim(), DETAIL_TAIL_CHARS);
    if tail.is_empty() {
        format!("{}, no output", status)
    } else {
        format!("{}: {}", status, tail)
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    match s.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((idx, _)) if max > 0 => &s[idx..],
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ProcessRegistry, SandboxConfig, TerminationReason};
    use crate::verifier::OutcomeKind;
    use tempfile::TempDir;

    fn output(exit_code: Option<i32>, stdout: &str, stderr: &str) -> SandboxOutput {
        SandboxOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            signal: None,
            termination: TerminationReason::Exited,
            duration: Duration::from_millis(10),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    fn markers() -> Vec<String> {
        DEFAULT_REJECT_MARKERS.iter().map(|s| s.to_string()).collect()
    }

    fn stub_verifier(root: &Path, script: &str) -> Verifier {
        let sandbox = ProcessSandbox::new(
            SandboxConfig::new().with_grace_period(Duration::from_millis(200)),
            ProcessRegistry::new(),
        );
        let config = VerifierConfig::new(root)
            .with_command(VerifierCommand::new("sh", ["-c", script, "stub", "{input}"]))
            .with_timeout(Duration::from_secs(5))
            .with_require_manifest(false);
        Verifier::new(sandbox, config)
    }

    #[test]
    fn test_timeout_takes_precedence() {
        let mut out = output(None, "a.lean:1:1: error: boom", "");
        out.termination = TerminationReason::TimedOut;
        let matcher = RegexDiagnosticMatcher::lean_default();
        assert_eq!(classify(&out, &matcher, &markers()), VerificationOutcome::Timeout);
    }

    #[test]
    fn test_failure_with_diagnostic() {
        let out = output(Some(1), "x.lean:4:2: error: linarith failed\n", "");
        let matcher = RegexDiagnosticMatcher::lean_default();
        let outcome = classify(&out, &matcher, &markers());
        assert_eq!(outcome.kind(), OutcomeKind::VerifierError);
        assert!(outcome.detail().unwrap().contains("linarith failed"));
    }

    #[test]
    fn test_failure_without_diagnostic() {
        let out = output(Some(3), "something odd\n", "");
        let matcher = RegexDiagnosticMatcher::lean_default();
        let outcome = classify(&out, &matcher, &markers());
        assert_eq!(outcome.kind(), OutcomeKind::IncorrectNoDiagnostic);
        assert_eq!(outcome.detail().unwrap(), "exit code 3: something odd");
    }

    #[test]
    fn test_killed_by_signal_without_output() {
        let mut out = output(None, "", "");
        out.signal = Some(9);
        let matcher = RegexDiagnosticMatcher::lean_default();
        let outcome = classify(&out, &matcher, &markers());
        assert_eq!(
            outcome,
            VerificationOutcome::IncorrectNoDiagnostic {
                detail: "killed by signal 9, no output".into()
            }
        );
    }

    #[test]
    fn test_sorry_on_clean_exit_is_rejected() {
        let out = output(Some(0), "x.lean:3:8: warning: declaration uses 'sorry'\n", "");
        let matcher = RegexDiagnosticMatcher::lean_default();
        let outcome = classify(&out, &matcher, &markers());
        assert_eq!(outcome.kind(), OutcomeKind::VerifierError);

        assert_eq!(classify(&out, &matcher, &[]), VerificationOutcome::Success);
    }

    #[test]
    fn test_clean_exit_is_success() {
        let out = output(Some(0), "", "");
        let matcher = RegexDiagnosticMatcher::lean_default();
        assert_eq!(classify(&out, &matcher, &markers()), VerificationOutcome::Success);
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("⊢⊢⊢", 2), "⊢⊢");
        assert_eq!(tail_chars("ab", 10), "ab");
    }

    #[test]
    fn test_command_parse_and_display() {
        let cmd = VerifierCommand::parse("lake env lean {input}").unwrap();
        assert_eq!(cmd, VerifierCommand::default());
        assert_eq!(cmd.to_string(), "lake env lean {input}");
        assert!(VerifierCommand::parse("   ").is_none());
    }

    #[test]
    fn test_check_project_requires_manifest() {
        let dir = TempDir::new().unwrap();
        let verifier = stub_verifier(dir.path(), "exit 0");
        assert!(verifier.check_project().is_ok());

        let strict = Verifier::new(
            verifier.sandbox().clone(),
            verifier.config().clone().with_require_manifest(true),
        );
        assert!(matches!(strict.check_project(), Err(EvalError::SandboxFatal(_))));

        std::fs::write(dir.path().join("lakefile.lean"), "").unwrap();
        assert!(strict.check_project().is_ok());
    }

    #[test]
    fn test_check_project_missing_root() {
        let verifier = stub_verifier(Path::new("/nonexistent/prover-eval-root"), "exit 0");
        assert!(matches!(verifier.check_project(), Err(EvalError::SandboxFatal(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_reads_staged_unit() {
        let dir = TempDir::new().unwrap();
        let verifier = stub_verifier(dir.path(), "grep -q 'theorem ok' \"$1\"");
        let ok = verifier.verify("theorem ok : True := trivial", "s0_p_a0").await.unwrap();
        assert_eq!(ok, VerificationOutcome::Success);

        let bad = verifier.verify("theorem nope : False := sorry", "s0_p_a1").await.unwrap();
        assert_eq!(bad.kind(), OutcomeKind::IncorrectNoDiagnostic);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_missing_program_is_fatal() {
        let dir = TempDir::new().unwrap();
        let sandbox = ProcessSandbox::new(SandboxConfig::default(), ProcessRegistry::new());
        let config = VerifierConfig::new(dir.path())
            .with_command(VerifierCommand::new("prover-eval-no-such-binary", ["{input}"]));
        let verifier = Verifier::new(sandbox, config);
        let err = verifier.verify("x", "s0_p_a0").await.unwrap_err();
        assert!(matches!(err, VerifyError::Fatal(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_cancelled_registry() {
        let dir = TempDir::new().unwrap();
        let verifier = stub_verifier(dir.path(), "exit 0");
        verifier.sandbox().registry().cancel();
        let err = verifier.verify("x", "s0_p_a0").await.unwrap_err();
        assert!(matches!(err, VerifyError::Cancelled));
    }
}
