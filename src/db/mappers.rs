use crate::error::{Result, SwarmError};
use crate::types::{
    CircuitBreakerRecord, CircuitConfig, CircuitLevel, CircuitState, Complexity, ExecutionRun,
    RunId, RunStatus, StopReason, Task, TaskId, TaskKey, TaskStatus, TaskType, WorkerId,
    WorkerRecord, WorkerStatus,
};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Fixed-width UTC format; lexical order of stored values equals time order.
const DB_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[must_use]
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.format(DB_TIME_FORMAT).to_string()
}

pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DB_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| SwarmError::DatabaseError(format!("Invalid timestamp '{raw}': {e}")))
}

pub fn from_db_time_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(from_db_time).transpose()
}

pub fn to_json_column<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(SwarmError::from)
}

fn from_json_column<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| SwarmError::DatabaseError(format!("Invalid JSON in {column}: {e}")))
}

pub const fn to_u32(value: i64) -> u32 {
    if value < 0 {
        0
    } else if value > u32::MAX as i64 {
        u32::MAX
    } else {
        value as u32
    }
}

pub const fn to_u64(value: i64) -> u64 {
    if value < 0 {
        0
    } else {
        value.cast_unsigned()
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub task_key: String,
    pub status: String,
    pub phase: i64,
    pub sequence: i64,
    pub depends_on: String,
    pub test_file: String,
    pub impl_file: String,
    pub acceptance_criteria: String,
    pub complexity: String,
    pub task_type: String,
    pub module_exports: String,
    pub claimed_by: Option<i64>,
    pub claimed_at: Option<String>,
    pub claim_expires_at: Option<String>,
    pub version: i64,
}

pub const TASK_COLUMNS: &str = "id, task_key, status, phase, sequence, depends_on, test_file, impl_file, \
     acceptance_criteria, complexity, task_type, module_exports, claimed_by, claimed_at, \
     claim_expires_at, version";

impl TryFrom<TaskRow> for Task {
    type Error = SwarmError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let depends_on: Vec<String> = from_json_column("depends_on", &row.depends_on)?;
        Ok(Self {
            id: TaskId::new(row.id),
            task_key: TaskKey::new(row.task_key),
            status: TaskStatus::try_from(row.status.as_str()).map_err(SwarmError::DatabaseError)?,
            phase: row.phase,
            sequence: row.sequence,
            depends_on: depends_on.into_iter().map(TaskKey::new).collect(),
            test_file: row.test_file,
            impl_file: row.impl_file,
            acceptance_criteria: from_json_column(
                "acceptance_criteria",
                &row.acceptance_criteria,
            )?,
            complexity: Complexity::try_from(row.complexity.as_str())
                .map_err(SwarmError::DatabaseError)?,
            task_type: TaskType::try_from(row.task_type.as_str())
                .map_err(SwarmError::DatabaseError)?,
            module_exports: from_json_column("module_exports", &row.module_exports)?,
            claimed_by: row.claimed_by.map(|id| WorkerId::new(to_u32(id))),
            claimed_at: from_db_time_opt(row.claimed_at)?,
            claim_expires_at: from_db_time_opt(row.claim_expires_at)?,
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct WorkerRow {
    pub worker_id: i64,
    pub status: String,
    pub last_heartbeat: String,
    pub current_task_id: Option<i64>,
}

impl TryFrom<WorkerRow> for WorkerRecord {
    type Error = SwarmError;

    fn try_from(row: WorkerRow) -> Result<Self> {
        Ok(Self {
            worker_id: WorkerId::new(to_u32(row.worker_id)),
            status: WorkerStatus::try_from(row.status.as_str())
                .map_err(SwarmError::DatabaseError)?,
            last_heartbeat: from_db_time(&row.last_heartbeat)?,
            current_task_id: row.current_task_id.map(TaskId::new),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub max_workers: i64,
    pub status: String,
    pub total_invocations: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub stopped_reason: Option<String>,
    pub validation_passed: Option<bool>,
    pub validation_summary: Option<String>,
}

impl TryFrom<RunRow> for ExecutionRun {
    type Error = SwarmError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: RunId::new(row.id),
            max_workers: to_u32(row.max_workers),
            status: RunStatus::try_from(row.status.as_str()).map_err(SwarmError::DatabaseError)?,
            total_invocations: to_u64(row.total_invocations),
            started_at: from_db_time(&row.started_at)?,
            completed_at: from_db_time_opt(row.completed_at)?,
            stopped_reason: row
                .stopped_reason
                .as_deref()
                .map(StopReason::try_from)
                .transpose()
                .map_err(SwarmError::DatabaseError)?,
            validation_passed: row.validation_passed,
            validation_summary: row.validation_summary,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CircuitRow {
    pub level: String,
    pub identifier: String,
    pub state: String,
    pub failure_count: i64,
    pub success_count: i64,
    pub opened_at: Option<String>,
    pub updated_at: String,
    pub version: i64,
}

pub fn parse_circuit(row: CircuitRow, config: CircuitConfig) -> Result<CircuitBreakerRecord> {
    Ok(CircuitBreakerRecord {
        level: CircuitLevel::try_from(row.level.as_str()).map_err(SwarmError::DatabaseError)?,
        identifier: row.identifier,
        state: CircuitState::try_from(row.state.as_str()).map_err(SwarmError::DatabaseError)?,
        failure_count: to_u32(row.failure_count),
        success_count: to_u32(row.success_count),
        opened_at: from_db_time_opt(row.opened_at)?,
        updated_at: from_db_time(&row.updated_at)?,
        version: row.version,
        config,
    })
}
