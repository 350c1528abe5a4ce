use super::mappers::{to_db_time, RunRow};
use super::{db_error, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::types::{ExecutionRun, RunId, RunStatus, StopReason};
use tracing::info;

const RUN_COLUMNS: &str = "id, max_workers, status, total_invocations, started_at, completed_at, \
     stopped_reason, validation_passed, validation_summary";

pub struct RunRepository<'a> {
    db: &'a SwarmDb,
}

impl<'a> RunRepository<'a> {
    pub(crate) const fn new(db: &'a SwarmDb) -> Self {
        Self { db }
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn start(&self, max_workers: u32) -> Result<ExecutionRun> {
        let id = {
            let _guard = self.db.write_guard().await;
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO execution_runs (max_workers, status, total_invocations, started_at)
                 VALUES (?, 'running', 0, ?)
                 RETURNING id",
            )
            .bind(i64::from(max_workers))
            .bind(to_db_time(self.db.now()))
            .fetch_one(self.db.pool())
            .await
            .map_err(db_error("start run"))?
        };

        let run_id = RunId::new(id);
        info!(run_id = %run_id, max_workers, "Execution run started");
        self.get(run_id)
            .await?
            .ok_or_else(|| SwarmError::DatabaseError(format!("{run_id} vanished after insert")))
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get(&self, run_id: RunId) -> Result<Option<ExecutionRun>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_runs WHERE id = ?"
        ))
        .bind(run_id.value())
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("load run"))?
        .map(ExecutionRun::try_from)
        .transpose()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn latest(&self) -> Result<Option<ExecutionRun>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_runs ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("load latest run"))?
        .map(ExecutionRun::try_from)
        .transpose()
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_invocations(&self, run_id: RunId, total: u64) -> Result<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("UPDATE execution_runs SET total_invocations = ? WHERE id = ?")
            .bind(i64::try_from(total).unwrap_or(i64::MAX))
            .bind(run_id.value())
            .execute(self.db.pool())
            .await
            .map(|_| ())
            .map_err(db_error("record invocations"))
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        stopped_reason: Option<StopReason>,
    ) -> Result<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "UPDATE execution_runs
             SET status = ?, stopped_reason = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(stopped_reason.map(|r| r.as_str()))
        .bind(to_db_time(self.db.now()))
        .bind(run_id.value())
        .execute(self.db.pool())
        .await
        .map(|_| ())
        .map_err(db_error("finish run"))
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn record_validation(&self, run_id: RunId, passed: bool, summary: &str) -> Result<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "UPDATE execution_runs SET validation_passed = ?, validation_summary = ? WHERE id = ?",
        )
        .bind(passed)
        .bind(summary)
        .bind(run_id.value())
        .execute(self.db.pool())
        .await
        .map(|_| ())
        .map_err(db_error("record run validation"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use crate::db::test_support::memory_db;
    use crate::types::{RunStatus, StopReason};

    #[tokio::test]
    async fn run_lifecycle_is_persisted() {
        let (db, _clock) = memory_db().await;
        let run = db.runs().start(3).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.max_workers, 3);

        db.runs().set_invocations(run.id, 17).await.unwrap();
        db.runs()
            .finish(run.id, RunStatus::Failed, Some(StopReason::InvocationLimit))
            .await
            .unwrap();
        db.runs()
            .record_validation(run.id, false, "lint failed")
            .await
            .unwrap();

        let stored = db.runs().latest().await.unwrap().unwrap();
        assert_eq!(stored.id, run.id);
        assert_eq!(stored.total_invocations, 17);
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.stopped_reason, Some(StopReason::InvocationLimit));
        assert_eq!(stored.validation_passed, Some(false));
        assert!(stored.completed_at.is_some());
    }
}
