//! Lean 4 proof extraction.
//!
//! The model is asked to complete a Lean file and typically echoes the
//! theorem with a proof, either bare or inside a fenced code block, possibly
//! after free-form reasoning. The extractor picks the last declaration of the
//! problem's theorem that carries a real proof and splices it after the
//! problem's own preamble (imports, `open` lines), so the unit always checks
//! against the original header rather than whatever the model chose to import.

use regex::Regex;

use super::Extractor;
use crate::error::ExtractionError;
use crate::problem::Problem;

const DECL_KEYWORDS: &[&str] = &["theorem", "lemma"];

/// Extracts the last proved declaration of the problem's theorem.
#[derive(Debug, Clone)]
pub struct LeanBlockExtractor {
    fence: Regex,
    decl_name: Regex,
}

impl LeanBlockExtractor {
    pub fn new() -> Self {
        Self {
            fence: Regex::new(r"(?s)```lean4?[ \t]*\r?\n(.*?)```").expect("fence pattern is valid"),
            decl_name: Regex::new(r"\b(?:theorem|lemma)\s+([^\s:({\[]+)")
                .expect("declaration pattern is valid"),
        }
    }

    /// Name of the first `theorem`/`lemma` in a statement.
    pub fn theorem_name(&self, statement: &str) -> Option<String> {
        self.decl_name
            .captures(statement)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Pulls the proved declaration of `name` out of `raw`.
    pub fn solution_block(&self, raw: &str, name: &str) -> Result<String, ExtractionError> {
        let decl = declaration_pattern(name)
            .ok_or_else(|| ExtractionError::TheoremNotFound(name.to_string()))?;
        let Some(last_decl) = decl.find_iter(raw).last() else {
            return Err(ExtractionError::TheoremNotFound(name.to_string()));
        };

        let fenced = self
            .fence
            .captures_iter(raw)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect::<Vec<_>>();

        let from_block = fenced.iter().rev().find_map(|block| {
            let start = decl.find_iter(block).last()?.start();
            let candidate = block[start..].trim();
            has_real_proof(candidate).then_some(candidate)
        });

        let solution = match from_block {
            Some(candidate) => candidate,
            None => {
                let tail = &raw[last_decl.start()..];
                let end = tail.find("```").unwrap_or(tail.len());
                tail[..end].trim()
            }
        };

        let cleaned = strip_header_lines(solution);
        if cleaned.is_empty() {
            return Err(ExtractionError::EmptyBlock);
        }
        Ok(cleaned)
    }
}

impl Default for LeanBlockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for LeanBlockExtractor {
    fn extract(&self, problem: &Problem, raw: &str) -> Result<String, ExtractionError> {
        let name = self
            .theorem_name(&problem.statement)
            .ok_or(ExtractionError::NoTheoremName)?;
        let block = self.solution_block(raw, &name)?;
        Ok(merge_with_preamble(&problem.statement, &block))
    }
}

fn declaration_pattern(name: &str) -> Option<Regex> {
    let pattern = format!(
        r"\b(?:{})\s+{}(?:[\s:({{\[]|$)",
        DECL_KEYWORDS.join("|"),
        regex::escape(name)
    );
    Regex::new(&pattern).ok()
}

/// True if the declaration has a `:=` whose body is more than `sorry`.
fn has_real_proof(decl: &str) -> bool {
    let Some(idx) = decl.find(":=") else {
        return false;
    };
    let body = decl[idx + 2..].trim();
    let body = body.strip_prefix("by").map(str::trim).unwrap_or(body);
    !body.is_empty() && body != "sorry"
}

fn strip_header_lines(solution: &str) -> String {
    let kept: Vec<&str> = solution
        .lines()
        .filter(|ln| {
            let s = ln.trim_start();
            !(s.starts_with("import ") || s.starts_with("open "))
        })
        .skip_while(|ln| ln.trim().is_empty())
        .collect();
    kept.join("\n").trim().to_string()
}

/// Places `solution` after everything in `statement` that precedes its first
/// declaration.
pub fn merge_with_preamble(statement: &str, solution: &str) -> String {
    let lines: Vec<&str> = statement.lines().collect();
    let first_decl = lines.iter().position(|ln| {
        let s = ln.trim_start();
        s.starts_with("theorem ") || s.starts_with("lemma ") || s.starts_with("example ")
    });

    match first_decl {
        None => format!("{}\n\n{}\n", statement.trim_end(), solution.trim()),
        Some(idx) => {
            let preamble = lines[..idx].join("\n");
            let preamble = preamble.trim_end();
            if preamble.is_empty() {
                format!("{}\n", solution.trim())
            } else {
                format!("{}\n\n{}\n", preamble, solution.trim())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATEMENT: &str = "import Mathlib\n\nopen Real Nat\n\ntheorem mathd_algebra_10 : abs ((120 : ℝ) / 100 * 30 - 130 / 100 * 20) = 10 := by\n  sorry\n";

    fn problem() -> Problem {
        Problem::new("problem_0001", STATEMENT)
    }

    #[test]
    fn test_theorem_name() {
        let ex = LeanBlockExtractor::new();
        assert_eq!(ex.theorem_name(STATEMENT).as_deref(), Some("mathd_algebra_10"));
        assert_eq!(ex.theorem_name("lemma foo (x : ℕ) : x = x := rfl").as_deref(), Some("foo"));
        assert_eq!(ex.theorem_name("example : True := trivial"), None);
    }

    #[test]
    fn test_extract_prefers_last_proved_block() {
        let raw = "Here is the statement:\n```lean4\ntheorem mathd_algebra_10 : abs (x) = 10 := by\n  sorry\n```\n\
                   Reasoning...\n```lean4\nimport Mathlib\ntheorem mathd_algebra_10 : abs (x) = 10 := by\n  norm_num [abs_of_nonneg]\n```\n";
        let unit = LeanBlockExtractor::new().extract(&problem(), raw).unwrap();
        assert!(unit.starts_with("import Mathlib\n\nopen Real Nat\n\ntheorem mathd_algebra_10"));
        assert!(unit.contains("norm_num"));
        assert!(!unit.contains("sorry"));
        assert_eq!(unit.matches("import Mathlib").count(), 1);
    }

    #[test]
    fn test_extract_without_fence() {
        let raw = "theorem mathd_algebra_10 : abs (x) = 10 := by\n  norm_num\n";
        let unit = LeanBlockExtractor::new().extract(&problem(), raw).unwrap();
        assert!(unit.ends_with("norm_num\n"));
    }

    #[test]
    fn test_extract_falls_back_to_unfenced_tail() {
        let raw = "theorem mathd_algebra_10 : abs (x) = 10 := by\n  simp\n```\ntrailing";
        let block = LeanBlockExtractor::new()
            .solution_block(raw, "mathd_algebra_10")
            .unwrap();
        assert_eq!(block, "theorem mathd_algebra_10 : abs (x) = 10 := by\n  simp");
    }

    #[test]
    fn test_extract_theorem_not_found() {
        let err = LeanBlockExtractor::new()
            .extract(&problem(), "I cannot solve this.")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::TheoremNotFound(name) if name == "mathd_algebra_10"));
    }

    #[test]
    fn test_name_prefix_does_not_match() {
        let raw = "theorem mathd_algebra_100 : True := trivial";
        assert!(LeanBlockExtractor::new()
            .solution_block(raw, "mathd_algebra_10")
            .is_err());
    }

    #[test]
    fn test_no_theorem_name() {
        let p = Problem::new("p", "example : True := trivial");
        let err = LeanBlockExtractor::new().extract(&p, "anything").unwrap_err();
        assert!(matches!(err, ExtractionError::NoTheoremName));
    }

    #[test]
    fn test_has_real_proof() {
        assert!(has_real_proof("theorem t : True := trivial"));
        assert!(has_real_proof("theorem t : True := by\n  simp"));
        assert!(!has_real_proof("theorem t : True := by sorry"));
        assert!(!has_real_proof("theorem t : True := sorry"));
        assert!(!has_real_proof("theorem t : True"));
    }

    #[test]
    fn test_merge_with_preamble_without_declaration() {
        let merged = merge_with_preamble("import Mathlib\n", "theorem t : True := trivial");
        assert_eq!(merged, "import Mathlib\n\ntheorem t : True := trivial\n");
    }
}
