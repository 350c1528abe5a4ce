use super::mappers::{from_db_time, from_db_time_opt, to_db_time, to_u32};
use super::{db_error, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::types::{AttemptOutcome, ReleaseOutcome, Stage, TaskId, WorkerId};
use chrono::{DateTime, Utc};

const MAX_OUTPUT_CHARS: usize = 4000;

/// One stage execution as written to `stage_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttemptEntry {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub stage: Stage,
    pub attempt: u32,
    pub escalated: bool,
    pub outcome: AttemptOutcome,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttemptRecord {
    pub id: i64,
    pub entry: StageAttemptEntry,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAuditRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub outcome: Option<ReleaseOutcome>,
}

type StageAttemptRow = (i64, i64, Option<i64>, String, i64, bool, String, String, i64, String);
type ClaimRow = (i64, i64, String, Option<String>, Option<String>);

pub struct AuditRepository<'a> {
    db: &'a SwarmDb,
}

impl<'a> AuditRepository<'a> {
    pub(crate) const fn new(db: &'a SwarmDb) -> Self {
        Self { db }
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record_stage_attempt(&self, entry: &StageAttemptEntry) -> Result<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "INSERT INTO stage_attempts
                 (task_id, worker_id, stage, attempt, escalated, outcome, output, duration_ms, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.task_id.value())
        .bind(entry.worker_id.map(|w| w.to_db()))
        .bind(entry.stage.as_str())
        .bind(i64::from(entry.attempt))
        .bind(entry.escalated)
        .bind(entry.outcome.as_str())
        .bind(truncate_output(&entry.output))
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(to_db_time(self.db.now()))
        .execute(self.db.pool())
        .await
        .map(|_| ())
        .map_err(db_error("record stage attempt"))
    }

    /// Attempts for one task in recording order.
    ///
    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn stage_attempts(&self, task_id: TaskId) -> Result<Vec<StageAttemptRecord>> {
        sqlx::query_as::<_, StageAttemptRow>(
            "SELECT id, task_id, worker_id, stage, attempt, escalated, outcome, output, duration_ms, recorded_at
             FROM stage_attempts WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id.value())
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("load stage attempts"))?
        .into_iter()
        .map(parse_stage_attempt)
        .collect()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn claim_history(&self, task_id: TaskId) -> Result<Vec<ClaimAuditRecord>> {
        sqlx::query_as::<_, ClaimRow>(
            "SELECT task_id, worker_id, claimed_at, released_at, outcome
             FROM task_claims WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id.value())
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("load claim history"))?
        .into_iter()
        .map(|(task_id, worker_id, claimed_at, released_at, outcome)| {
            Ok(ClaimAuditRecord {
                task_id: TaskId::new(task_id),
                worker_id: WorkerId::new(to_u32(worker_id)),
                claimed_at: from_db_time(&claimed_at)?,
                released_at: from_db_time_opt(released_at)?,
                outcome: outcome
                    .as_deref()
                    .map(ReleaseOutcome::try_from)
                    .transpose()
                    .map_err(SwarmError::DatabaseError)?,
            })
        })
        .collect()
    }

    /// Total number of claims ever taken, across all tasks.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn total_claims(&self) -> Result<u64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM task_claims")
            .fetch_one(self.db.pool())
            .await
            .map(super::mappers::to_u64)
            .map_err(db_error("count claims"))
    }
}

fn parse_stage_attempt(row: StageAttemptRow) -> Result<StageAttemptRecord> {
    let (id, task_id, worker_id, stage, attempt, escalated, outcome, output, duration_ms, recorded_at) =
        row;
    Ok(StageAttemptRecord {
        id,
        entry: StageAttemptEntry {
            task_id: TaskId::new(task_id),
            worker_id: worker_id.map(|w| WorkerId::new(to_u32(w))),
            stage: Stage::try_from(stage.as_str()).map_err(SwarmError::DatabaseError)?,
            attempt: to_u32(attempt),
            escalated,
            outcome: AttemptOutcome::try_from(outcome.as_str())
                .map_err(SwarmError::DatabaseError)?,
            output,
            duration_ms: super::mappers::to_u64(duration_ms),
        },
        recorded_at: from_db_time(&recorded_at)?,
    })
}

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let mut truncated: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
    truncated.push_str("\n[truncated]");
    truncated
}
