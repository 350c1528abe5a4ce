use crate::clock::Clock;
use crate::types::Violation;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedFixDenial {
    MaxAttempts,
    Timeout,
    Oscillation,
}

impl fmt::Display for RedFixDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAttempts => write!(f, "max RED_FIX attempts reached"),
            Self::Timeout => write!(f, "RED_FIX time budget exhausted"),
            Self::Oscillation => write!(f, "review issues are oscillating between fixes"),
        }
    }
}

/// Bounds the RED_FIX loop of a single task by attempt count, aggregate wall
/// clock and issue-set oscillation.
pub struct RedFixAttemptTracker {
    attempts: u32,
    max_attempts: u32,
    issue_fingerprints: Vec<String>,
    start_time: DateTime<Utc>,
    aggregate_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedFixAttemptTracker {
    #[must_use]
    pub fn new(max_attempts: u32, aggregate_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            issue_fingerprints: Vec::new(),
            start_time: clock.now(),
            aggregate_timeout,
            clock,
        }
    }

    /// Checks, in order: attempt ceiling, time budget, oscillation.
    ///
    /// # Errors
    /// Returns the first reason another attempt is not allowed.
    pub fn can_attempt(&self) -> Result<(), RedFixDenial> {
        if self.attempts >= self.max_attempts {
            return Err(RedFixDenial::MaxAttempts);
        }
        let elapsed = (self.clock.now() - self.start_time)
            .to_std()
            .unwrap_or_default();
        if elapsed > self.aggregate_timeout {
            return Err(RedFixDenial::Timeout);
        }
        if self.is_oscillating() {
            return Err(RedFixDenial::Oscillation);
        }
        Ok(())
    }

    /// Records one fix attempt against the given review issues.
    pub fn record_attempt(&mut self, violations: &[Violation]) {
        self.attempts = self.attempts.saturating_add(1);
        self.issue_fingerprints.push(issue_fingerprint(violations));
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn is_oscillating(&self) -> bool {
        let n = self.issue_fingerprints.len();
        n >= 3 && self.issue_fingerprints[n - 1] == self.issue_fingerprints[n - 3]
    }
}

/// Order-independent digest of the `(pattern, line)` pairs of a review.
#[must_use]
pub fn issue_fingerprint(violations: &[Violation]) -> String {
    let canonical = violations
        .iter()
        .map(|v| (v.pattern.as_str(), v.line))
        .sorted()
        .map(|(pattern, line)| format!("{pattern}:{line}"))
        .join("\n");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
