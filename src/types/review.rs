use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub pattern: String,
    pub line: u32,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub snippet: String,
}

impl Violation {
    #[must_use]
    pub fn new(pattern: impl Into<String>, line: u32, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            line,
            message: String::new(),
            severity,
            snippet: String::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewResult {
    pub violations: Vec<Violation>,
    pub is_blocking: bool,
}

impl ReviewResult {
    /// Builds a result whose blocking flag is derived from the violations.
    #[must_use]
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let is_blocking = violations.iter().any(|v| v.severity == Severity::Error);
        Self {
            violations,
            is_blocking,
        }
    }

    #[must_use]
    pub fn clean() -> Self {
        Self::default()
    }
}

/// Result of one subprocess-style check (test run, lint, type-check).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub output: String,
}

impl CheckOutcome {
    #[must_use]
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    #[must_use]
    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub tests: CheckOutcome,
    pub lint: CheckOutcome,
    pub typecheck: CheckOutcome,
    pub static_analysis: CheckOutcome,
}

impl VerifyReport {
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.tests.passed && self.lint.passed && self.typecheck.passed && self.static_analysis.passed
    }

    /// Concatenated output of every failing check, used as FIX context.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        [
            ("tests", &self.tests),
            ("lint", &self.lint),
            ("typecheck", &self.typecheck),
            ("static_analysis", &self.static_analysis),
        ]
        .into_iter()
        .filter(|(_, check)| !check.passed)
        .map(|(name, check)| format!("[{name}]\n{}", check.output.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
    }
}

/// Size figures for one produced file, fed to the refactor policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMetrics {
    pub line_count: usize,
    pub functions: Vec<(String, usize)>,
    pub classes: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::{CheckOutcome, ReviewResult, Severity, VerifyReport, Violation};

    #[test]
    fn review_blocks_only_on_error_severity() {
        let warnings = ReviewResult::from_violations(vec![Violation::new(
            "bare-except",
            4,
            Severity::Warning,
        )]);
        assert!(!warnings.is_blocking);

        let errors = ReviewResult::from_violations(vec![
            Violation::new("bare-except", 4, Severity::Warning),
            Violation::new("assert-true", 9, Severity::Error),
        ]);
        assert!(errors.is_blocking);
    }

    #[test]
    fn verify_report_requires_every_check() {
        let mut report = VerifyReport {
            tests: CheckOutcome::pass("ok"),
            lint: CheckOutcome::pass("ok"),
            typecheck: CheckOutcome::pass("ok"),
            static_analysis: CheckOutcome::pass("ok"),
        };
        assert!(report.passed());
        assert!(report.failure_summary().is_empty());

        report.typecheck = CheckOutcome::fail("x: expected int");
        assert!(!report.passed());
        assert!(report.failure_summary().contains("[typecheck]"));
    }
}
