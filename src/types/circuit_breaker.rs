#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn allows_operations(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl TryFrom<&str> for CircuitState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" | "half-open" => Ok(Self::HalfOpen),
            _ => Err(format!("Unknown circuit state: {value}")),
        }
    }
}

/// Scope a breaker guards. Stage breakers gate executor calls, worker breakers
/// track per-worker task outcomes, system breakers track whole phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitLevel {
    Stage,
    Worker,
    System,
}

impl CircuitLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Worker => "worker",
            Self::System => "system",
        }
    }
}

impl fmt::Display for CircuitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CircuitLevel {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "stage" => Ok(Self::Stage),
            "worker" => Ok(Self::Worker),
            "system" => Ok(Self::System),
            _ => Err(format!("Unknown circuit level: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl CircuitConfig {
    #[must_use]
    pub const fn new(failure_threshold: u32, success_threshold: u32, reset_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout_secs,
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::new(5, 3, 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub level: CircuitLevel,
    pub identifier: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
    pub config: CircuitConfig,
}

impl CircuitBreakerRecord {
    #[must_use]
    pub fn new(
        level: CircuitLevel,
        identifier: impl Into<String>,
        config: CircuitConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            level,
            identifier: identifier.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            updated_at: now,
            version: 0,
            config,
        }
    }

    #[must_use]
    pub const fn should_open(&self) -> bool {
        match self.state {
            CircuitState::Closed => self.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => self.failure_count > 0,
            CircuitState::Open => false,
        }
    }

    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(self.state, CircuitState::HalfOpen)
            && self.success_count >= self.config.success_threshold
    }

    #[must_use]
    pub fn record_failure(mut self, now: DateTime<Utc>) -> Self {
        self.failure_count = self.failure_count.saturating_add(1);
        self.success_count = 0;
        self.updated_at = now;

        if self.should_open() {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }

        self
    }

    #[must_use]
    pub fn record_success(mut self, now: DateTime<Utc>) -> Self {
        self.failure_count = 0;
        self.success_count = self.success_count.saturating_add(1);
        self.updated_at = now;

        match self.state {
            CircuitState::HalfOpen if self.should_close() => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.success_count = 0;
            }
            CircuitState::Closed => self.success_count = 0,
            CircuitState::HalfOpen | CircuitState::Open => {}
        }

        self
    }

    /// Moves an open breaker to half-open once its cooldown has passed.
    #[must_use]
    pub fn try_half_open(mut self, now: DateTime<Utc>) -> Self {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                let elapsed = u64::try_from((now - opened_at).num_seconds()).unwrap_or(0);
                if elapsed >= self.config.reset_timeout_secs {
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.updated_at = now;
                }
            }
        }
        self
    }

    #[must_use]
    pub fn reset(mut self, now: DateTime<Utc>) -> Self {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.updated_at = now;
        self
    }
}
