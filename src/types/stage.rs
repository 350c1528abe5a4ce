use super::review::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Red,
    RedFix,
    Green,
    Verify,
    Refactor,
    Fix,
    ReVerify,
}

impl Stage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::RedFix => "red_fix",
            Self::Green => "green",
            Self::Verify => "verify",
            Self::Refactor => "refactor",
            Self::Fix => "fix",
            Self::ReVerify => "re_verify",
        }
    }

    /// Stages whose work lands in the tree and gets a stage-scoped commit.
    #[must_use]
    pub const fn produces_output(&self) -> bool {
        matches!(
            self,
            Self::Red | Self::RedFix | Self::Green | Self::Refactor | Self::Fix
        )
    }

    pub const ALL: [Self; 7] = [
        Self::Red,
        Self::RedFix,
        Self::Green,
        Self::Verify,
        Self::Refactor,
        Self::Fix,
        Self::ReVerify,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Stage {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "red" => Ok(Self::Red),
            "red_fix" => Ok(Self::RedFix),
            "green" => Ok(Self::Green),
            "verify" => Ok(Self::Verify),
            "refactor" => Ok(Self::Refactor),
            "fix" => Ok(Self::Fix),
            "re_verify" => Ok(Self::ReVerify),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}

/// Why a file was sent through the REFACTOR stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefactorReason {
    FileOverHardLimit { lines: usize, limit: usize },
    FileOverSoftLimit { lines: usize, limit: usize },
    LongFunction { name: String, lines: usize, limit: usize },
    LargeClass { name: String, methods: usize, limit: usize },
}

impl RefactorReason {
    #[must_use]
    pub const fn is_forced(&self) -> bool {
        !matches!(self, Self::FileOverSoftLimit { .. })
    }
}

impl fmt::Display for RefactorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileOverHardLimit { lines, limit } => {
                write!(f, "file has {lines} lines (hard limit {limit})")
            }
            Self::FileOverSoftLimit { lines, limit } => {
                write!(f, "file has {lines} lines (soft limit {limit})")
            }
            Self::LongFunction { name, lines, limit } => {
                write!(f, "function {name} has {lines} lines (limit {limit})")
            }
            Self::LargeClass {
                name,
                methods,
                limit,
            } => write!(f, "class {name} has {methods} methods (limit {limit})"),
        }
    }
}

/// Input for one StageExecutor call. Each variant carries only what that stage consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRequest {
    Red,
    RedFix {
        attempt: u32,
        violations: Vec<Violation>,
    },
    Green {
        attempt: u32,
        escalated: bool,
        prior_failure: Option<String>,
    },
    Refactor {
        reasons: Vec<RefactorReason>,
    },
    Fix {
        failure_output: String,
    },
}

impl StageRequest {
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Red => Stage::Red,
            Self::RedFix { .. } => Stage::RedFix,
            Self::Green { .. } => Stage::Green,
            Self::Refactor { .. } => Stage::Refactor,
            Self::Fix { .. } => Stage::Fix,
        }
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        match self {
            Self::RedFix { attempt, .. } | Self::Green { attempt, .. } => *attempt,
            Self::Red | Self::Refactor { .. } | Self::Fix { .. } => 1,
        }
    }

    #[must_use]
    pub const fn is_escalated(&self) -> bool {
        matches!(self, Self::Green { escalated: true, .. })
    }
}

/// Pass/fail answer from a StageExecutor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageVerdict {
    pub success: bool,
    pub output: String,
}

impl StageVerdict {
    #[must_use]
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    #[must_use]
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Passed,
    Failed,
    Timeout,
    Skipped,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

impl TryFrom<&str> for AttemptOutcome {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown attempt outcome: {value}")),
        }
    }
}
