use super::identifiers::TaskKey;
use super::task::TaskStatus;
use serde::{Deserialize, Serialize};

/// A `depends_on` entry naming a task key that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingDependency {
    pub task_key: TaskKey,
    pub missing: TaskKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteTask {
    pub task_key: TaskKey,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionFailure {
    pub test_file: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseGateResult {
    pub phase: i64,
    pub passed: bool,
    pub incomplete_tasks: Vec<IncompleteTask>,
    pub regression_failures: Vec<RegressionFailure>,
}

impl PhaseGateResult {
    #[must_use]
    pub const fn trivial_pass(phase: i64) -> Self {
        Self {
            phase,
            passed: true,
            incomplete_tasks: Vec::new(),
            regression_failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        if self.passed {
            return format!("phase {} gate passed", self.phase);
        }
        let mut parts = Vec::new();
        if !self.incomplete_tasks.is_empty() {
            let keys = self
                .incomplete_tasks
                .iter()
                .map(|t| format!("{} ({})", t.task_key, t.status))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("incomplete prior tasks: {keys}"));
        }
        if !self.regression_failures.is_empty() {
            let files = self
                .regression_failures
                .iter()
                .map(|f| f.test_file.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("regressions: {files}"));
        }
        format!("phase {} gate failed: {}", self.phase, parts.join("; "))
    }
}

/// Non-terminal task that cannot make further progress on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedTask {
    pub task_key: TaskKey,
    pub status: TaskStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunValidationResult {
    pub passed: bool,
    pub regression_failures: Vec<RegressionFailure>,
    pub lint_passed: bool,
    pub lint_output: String,
    pub typecheck_passed: bool,
    pub typecheck_output: String,
    pub orphaned_tasks: Vec<OrphanedTask>,
}

impl RunValidationResult {
    #[must_use]
    pub fn summary(&self) -> String {
        if self.passed {
            return "run validation passed".to_string();
        }
        let mut parts = Vec::new();
        if !self.regression_failures.is_empty() {
            parts.push(format!("{} regression failure(s)", self.regression_failures.len()));
        }
        if !self.lint_passed {
            parts.push("lint failed".to_string());
        }
        if !self.typecheck_passed {
            parts.push("typecheck failed".to_string());
        }
        if !self.orphaned_tasks.is_empty() {
            parts.push(format!("{} orphaned task(s)", self.orphaned_tasks.len()));
        }
        format!("run validation failed: {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::{IncompleteTask, PhaseGateResult, RegressionFailure};
    use crate::types::{TaskKey, TaskStatus};

    #[test]
    fn failed_gate_summary_lists_both_categories() {
        let result = PhaseGateResult {
            phase: 1,
            passed: false,
            incomplete_tasks: vec![IncompleteTask {
                task_key: TaskKey::new("A-01"),
                status: TaskStatus::Blocked,
            }],
            regression_failures: vec![RegressionFailure {
                test_file: "tests/test_a.py".to_string(),
                output: "1 failed".to_string(),
            }],
        };
        let summary = result.summary();
        assert!(summary.contains("A-01 (blocked)"));
        assert!(summary.contains("tests/test_a.py"));
    }
}
