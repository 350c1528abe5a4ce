use super::identifiers::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for RunStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown run status: {value}")),
        }
    }
}

/// Why the pool stopped scheduling before running out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TaskFailure,
    InvocationLimit,
    PhaseGateFailed,
    MergeConflict,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TaskFailure => "task_failure",
            Self::InvocationLimit => "invocation_limit",
            Self::PhaseGateFailed => "phase_gate_failed",
            Self::MergeConflict => "merge_conflict",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StopReason {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "task_failure" => Ok(Self::TaskFailure),
            "invocation_limit" => Ok(Self::InvocationLimit),
            "phase_gate_failed" => Ok(Self::PhaseGateFailed),
            "merge_conflict" => Ok(Self::MergeConflict),
            _ => Err(format!("Unknown stop reason: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: RunId,
    pub max_workers: u32,
    pub status: RunStatus,
    pub total_invocations: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_reason: Option<StopReason>,
    pub validation_passed: Option<bool>,
    pub validation_summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::StopReason;

    #[test]
    fn stop_reasons_use_snake_case_strings() {
        for reason in [
            StopReason::TaskFailure,
            StopReason::InvocationLimit,
            StopReason::PhaseGateFailed,
            StopReason::MergeConflict,
        ] {
            assert_eq!(StopReason::try_from(reason.as_str()), Ok(reason));
        }
        assert_eq!(StopReason::TaskFailure.to_string(), "task_failure");
    }
}
