use crate::types::{ReleaseOutcome, Stage, TaskStatus, Violation};
use serde::Serialize;

/// How one pipeline run for a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Complete {
        /// Tests already passed after RED; RED_FIX and GREEN were skipped.
        pre_implemented: bool,
        refactored: bool,
        fixed: bool,
    },
    Failed {
        stage: Stage,
        reason: String,
    },
    BlockedStaticReview {
        reason: String,
        violations: Vec<Violation>,
    },
    /// The invocation budget ran out before the pipeline finished.
    BudgetExhausted {
        stage: Stage,
    },
}

impl PipelineOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Status to record before releasing. `None` leaves the task to the
    /// release fallback.
    #[must_use]
    pub const fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Complete { .. } => Some(TaskStatus::Complete),
            Self::Failed { .. } => Some(TaskStatus::Blocked),
            Self::BlockedStaticReview { .. } => Some(TaskStatus::BlockedStaticReview),
            Self::BudgetExhausted { .. } => None,
        }
    }

    #[must_use]
    pub const fn release_outcome(&self) -> ReleaseOutcome {
        match self {
            Self::Complete { .. } => ReleaseOutcome::Completed,
            Self::Failed { .. } | Self::BlockedStaticReview { .. } => ReleaseOutcome::Failed,
            Self::BudgetExhausted { .. } => ReleaseOutcome::Released,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Complete {
                pre_implemented,
                refactored,
                fixed,
            } => format!("complete (pre_implemented={pre_implemented}, refactored={refactored}, fixed={fixed})"),
            Self::Failed { stage, reason } => format!("failed at {stage}: {reason}"),
            Self::BlockedStaticReview { reason, violations } => {
                format!("blocked by static review ({reason}, {} violations)", violations.len())
            }
            Self::BudgetExhausted { stage } => format!("invocation budget exhausted before {stage}"),
        }
    }
}
