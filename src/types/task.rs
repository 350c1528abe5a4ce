use super::identifiers::{TaskId, TaskKey, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Passing,
    Complete,
    Blocked,
    BlockedStaticReview,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Passing => "passing",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
            Self::BlockedStaticReview => "blocked-static-review",
        }
    }

    /// Statuses that satisfy a dependency edge.
    #[must_use]
    pub const fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Complete | Self::Passing)
    }

    /// Statuses a task never leaves within one lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Passing | Self::Blocked | Self::BlockedStaticReview
        )
    }

    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedStaticReview)
    }

    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::Passing,
        Self::Complete,
        Self::Blocked,
        Self::BlockedStaticReview,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "passing" => Ok(Self::Passing),
            "complete" => Ok(Self::Complete),
            "blocked" => Ok(Self::Blocked),
            "blocked-static-review" | "blocked_static_review" => Ok(Self::BlockedStaticReview),
            _ => Err(format!("Unknown task status: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl TryFrom<&str> for Complexity {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown complexity: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[default]
    Implement,
    VerifyOnly,
}

impl TaskType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::VerifyOnly => "verify-only",
        }
    }
}

impl TryFrom<&str> for TaskType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "implement" => Ok(Self::Implement),
            "verify-only" | "verify_only" => Ok(Self::VerifyOnly),
            _ => Err(format!("Unknown task type: {value}")),
        }
    }
}

/// Task as produced upstream, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_key: TaskKey,
    pub phase: i64,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub depends_on: Vec<TaskKey>,
    pub test_file: String,
    pub impl_file: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub module_exports: Vec<String>,
}

impl NewTask {
    #[must_use]
    pub fn new(
        task_key: impl Into<String>,
        phase: i64,
        test_file: impl Into<String>,
        impl_file: impl Into<String>,
    ) -> Self {
        Self {
            task_key: TaskKey::new(task_key),
            phase,
            sequence: 0,
            depends_on: Vec::new(),
            test_file: test_file.into(),
            impl_file: impl_file.into(),
            acceptance_criteria: Vec::new(),
            complexity: Complexity::default(),
            task_type: TaskType::default(),
            module_exports: Vec::new(),
        }
    }

    #[must_use]
    pub fn depending_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(TaskKey::new).collect();
        self
    }

    #[must_use]
    pub const fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub const fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_key: TaskKey,
    pub status: TaskStatus,
    pub phase: i64,
    pub sequence: i64,
    pub depends_on: Vec<TaskKey>,
    pub test_file: String,
    pub impl_file: String,
    pub acceptance_criteria: Vec<String>,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub module_exports: Vec<String>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl From<&Task> for NewTask {
    fn from(task: &Task) -> Self {
        Self {
            task_key: task.task_key.clone(),
            phase: task.phase,
            sequence: task.sequence,
            depends_on: task.depends_on.clone(),
            test_file: task.test_file.clone(),
            impl_file: task.impl_file.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            complexity: task.complexity,
            task_type: task.task_type,
            module_exports: task.module_exports.clone(),
        }
    }
}

impl Task {
    /// True while a claim is held and its lease has not run out.
    #[must_use]
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.claim_expires_at.is_some_and(|expires| expires > now)
    }
}

/// Outcome recorded in the claim audit trail when a claim is let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseOutcome {
    Completed,
    Failed,
    Timeout,
    Released,
}

impl ReleaseOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Released => "released",
        }
    }

    /// Status a still-`in_progress` task takes when released with this outcome.
    /// `None` leaves the status untouched.
    #[must_use]
    pub const fn fallback_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Completed => None,
            Self::Failed => Some(TaskStatus::Blocked),
            Self::Timeout | Self::Released => Some(TaskStatus::Pending),
        }
    }
}

impl TryFrom<&str> for ReleaseOutcome {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "released" => Ok(Self::Released),
            _ => Err(format!("Unknown release outcome: {value}")),
        }
    }
}
