use super::identifiers::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    #[default]
    Idle,
    Dead,
}

impl WorkerStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Dead => "dead",
        }
    }
}

impl TryFrom<&str> for WorkerStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("Unknown worker status: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task_id: Option<TaskId>,
}

impl WorkerRecord {
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.status != WorkerStatus::Dead && now - self.last_heartbeat > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkerRecord, WorkerStatus};
    use crate::types::WorkerId;
    use chrono::{Duration, Utc};

    #[test]
    fn silent_worker_becomes_stale_after_threshold() {
        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: WorkerId::new(1),
            status: WorkerStatus::Active,
            last_heartbeat: now - Duration::seconds(120),
            current_task_id: None,
        };
        assert!(record.is_stale(now, Duration::seconds(90)));
        assert!(!record.is_stale(now, Duration::seconds(180)));

        let dead = WorkerRecord {
            status: WorkerStatus::Dead,
            ..record
        };
        assert!(!dead.is_stale(now, Duration::seconds(90)));
    }
}
