//! Recognition of verifier diagnostics.
//!
//! Whether a failed run counts as `VerifierError` or `IncorrectNoDiagnostic`
//! depends entirely on this predicate, so it is a trait with a configurable
//! regex implementation rather than fixed string matching.

use regex::Regex;

/// Lean prints `path:line:col: error: ...` on stdout. Anchored on the
/// position suffix since the path may contain spaces.
pub const LEAN_POSITIONAL_ERROR: &str = r"(?m)^.+?:\d+:\d+: error\b.*$";
/// Bare `error:` lines (lake, toolchain, and unpositioned Lean errors).
pub const BARE_ERROR: &str = r"(?m)^error:? .*$";

/// Default patterns for Lean 4 projects.
pub const DEFAULT_DIAGNOSTIC_PATTERNS: &[&str] = &[LEAN_POSITIONAL_ERROR, BARE_ERROR];

/// Predicate deciding whether verifier output carries a diagnostic.
pub trait DiagnosticMatcher: Send + Sync + std::fmt::Debug {
    /// Returns the recognized diagnostic text, if any.
    fn find_diagnostic(&self, stdout: &str, stderr: &str) -> Option<String>;
}

/// Regex-based matcher scanning both output streams.
#[derive(Debug, Clone)]
pub struct RegexDiagnosticMatcher {
    patterns: Vec<Regex>,
    max_lines: usize,
}

impl RegexDiagnosticMatcher {
    /// Compiles `patterns`; returns at most `max_lines` matching lines.
    pub fn new<S: AsRef<str>>(patterns: &[S], max_lines: usize) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            max_lines: max_lines.max(1),
        })
    }

    /// Matcher with [`DEFAULT_DIAGNOSTIC_PATTERNS`].
    pub fn lean_default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_PATTERNS, 10).expect("default diagnostic patterns are valid")
    }
}

impl DiagnosticMatcher for RegexDiagnosticMatcher {
    fn find_diagnostic(&self, stdout: &str, stderr: &str) -> Option<String> {
        let mut lines: Vec<&str> = Vec::new();
        for stream in [stdout, stderr] {
            for re in &self.patterns {
                for m in re.find_iter(stream) {
                    let line = m.as_str().trim_end();
                    if !lines.contains(&line) {
                        lines.push(line);
                    }
                    if lines.len() >= self.max_lines {
                        return Some(lines.join("\n"));
                    }
                }
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}
