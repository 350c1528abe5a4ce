use super::mappers::{to_db_time, to_json_column, to_u64, TaskRow, TASK_COLUMNS};
use super::{db_error, lease_deadline, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::types::{
    DanglingDependency, NewTask, ReleaseOutcome, Task, TaskId, TaskKey, TaskStatus, WorkerId,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Task count per status, in `TaskStatus::ALL` order.
pub type StatusCounts = BTreeMap<&'static str, u64>;

pub struct TaskRepository<'a> {
    db: &'a SwarmDb,
}

impl<'a> TaskRepository<'a> {
    pub(crate) const fn new(db: &'a SwarmDb) -> Self {
        Self { db }
    }

    /// # Errors
    /// Returns an error if the insert fails (including a duplicate task key).
    pub async fn insert(&self, task: &NewTask) -> Result<TaskId> {
        self.insert_many(std::slice::from_ref(task))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SwarmError::Internal("insert produced no id".to_string()))
    }

    /// Inserts all tasks in one transaction; a failure leaves none inserted.
    ///
    /// # Errors
    /// Returns an error if any insert fails.
    pub async fn insert_many(&self, tasks: &[NewTask]) -> Result<Vec<TaskId>> {
        let _guard = self.db.write_guard().await;
        let now = to_db_time(self.db.now());
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;
        let mut ids = Vec::with_capacity(tasks.len());

        for task in tasks {
            let depends_on: Vec<&str> = task.depends_on.iter().map(TaskKey::value).collect();
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO tasks (task_key, status, phase, sequence, depends_on, test_file, impl_file,
                                    acceptance_criteria, complexity, task_type, module_exports,
                                    created_at, updated_at)
                 VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 RETURNING id",
            )
            .bind(task.task_key.value())
            .bind(task.phase)
            .bind(task.sequence)
            .bind(to_json_column(&depends_on)?)
            .bind(&task.test_file)
            .bind(&task.impl_file)
            .bind(to_json_column(&task.acceptance_criteria)?)
            .bind(task.complexity.as_str())
            .bind(task.task_type.as_str())
            .bind(to_json_column(&task.module_exports)?)
            .bind(&now)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                SwarmError::DatabaseError(format!("Failed to insert task {}: {e}", task.task_key))
            })?;
            ids.push(TaskId::new(id));
        }

        tx.commit().await.map_err(db_error("commit tx"))?;
        info!(count = ids.len(), "Inserted tasks");
        Ok(ids)
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get(&self, task_id: TaskId) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(task_id.value())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_error("load task"))?
            .map(Task::try_from)
            .transpose()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get_by_key(&self, task_key: &TaskKey) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_key = ?"
        ))
        .bind(task_key.value())
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("load task by key"))?
        .map(Task::try_from)
        .transpose()
    }

    /// Tasks ordered by phase, sequence and id; `None` lists every phase.
    ///
    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn list(&self, phase: Option<i64>) -> Result<Vec<Task>> {
        let rows = match phase {
            Some(phase) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE phase = ? ORDER BY phase, sequence, id"
                ))
                .bind(phase)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY phase, sequence, id"
                ))
                .fetch_all(self.db.pool())
                .await
            }
        }
        .map_err(db_error("list tasks"))?;

        rows.into_iter().map(Task::try_from).collect()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn list_before_phase(&self, phase: i64) -> Result<Vec<Task>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE phase < ? ORDER BY phase, sequence, id"
        ))
        .bind(phase)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("list prior-phase tasks"))?
        .into_iter()
        .map(Task::try_from)
        .collect()
    }

    /// Distinct phases in ascending order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn phases(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT DISTINCT phase FROM tasks ORDER BY phase")
            .fetch_all(self.db.pool())
            .await
            .map_err(db_error("list phases"))
    }

    /// Pending tasks whose dependencies are all `complete` or `passing`.
    /// A dependency on an unknown key is never satisfied.
    ///
    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get_claimable_tasks(&self, phase: Option<i64>) -> Result<Vec<Task>> {
        let statuses = self.status_by_key().await?;
        let pending = self
            .list(phase)
            .await?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending);

        Ok(pending
            .filter(|task| {
                task.depends_on.iter().all(|dep| {
                    statuses
                        .get(dep.value())
                        .is_some_and(TaskStatus::satisfies_dependency)
                })
            })
            .collect())
    }

    async fn status_by_key(&self) -> Result<HashMap<String, TaskStatus>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT task_key, status FROM tasks")
            .fetch_all(self.db.pool())
            .await
            .map_err(db_error("load task statuses"))?;

        rows.into_iter()
            .map(|(key, status)| {
                TaskStatus::try_from(status.as_str())
                    .map(|status| (key, status))
                    .map_err(SwarmError::DatabaseError)
            })
            .collect()
    }

    /// Atomically claims a pending task and makes it the claiming worker's
    /// current task. Losing a race returns `false`.
    ///
    /// # Errors
    /// Returns an error only when the database itself fails.
    pub async fn claim(&self, task_id: TaskId, worker_id: WorkerId, lease: Duration) -> Result<bool> {
        let _guard = self.db.write_guard().await;
        let now = self.db.now();
        let now_text = to_db_time(now);
        let expires = to_db_time(lease_deadline(now, lease));
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let claimed = sqlx::query(
            "UPDATE tasks
             SET claimed_by = ?, claimed_at = ?, claim_expires_at = ?,
                 status = 'in_progress', version = version + 1, updated_at = ?
             WHERE id = ?
               AND status = 'pending'
               AND (claimed_by IS NULL OR claim_expires_at < ?)",
        )
        .bind(worker_id.to_db())
        .bind(&now_text)
        .bind(&expires)
        .bind(&now_text)
        .bind(task_id.value())
        .bind(&now_text)
        .execute(&mut *tx)
        .await
        .map(|r| r.rows_affected() == 1)
        .map_err(db_error("claim task"))?;

        if !claimed {
            tx.rollback().await.map_err(db_error("rollback tx"))?;
            debug!(task_id = %task_id, worker_id = %worker_id, "Claim lost");
            return Ok(false);
        }

        sqlx::query("INSERT INTO task_claims (task_id, worker_id, claimed_at) VALUES (?, ?, ?)")
            .bind(task_id.value())
            .bind(worker_id.to_db())
            .bind(&now_text)
            .execute(&mut *tx)
            .await
            .map_err(db_error("record claim"))?;

        sqlx::query(
            "UPDATE workers SET status = 'active', current_task_id = ?
             WHERE worker_id = ? AND status != 'dead'",
        )
        .bind(task_id.value())
        .bind(worker_id.to_db())
        .execute(&mut *tx)
        .await
        .map_err(db_error("mark worker active"))?;

        tx.commit().await.map_err(db_error("commit tx"))?;
        debug!(task_id = %task_id, worker_id = %worker_id, "Task claimed");
        Ok(true)
    }

    /// Clears the claim if `worker_id` holds it. A task still `in_progress`
    /// falls back according to the outcome (see `ReleaseOutcome::fallback_status`).
    /// Releasing twice returns `false` and writes no audit row.
    ///
    /// # Errors
    /// Returns an error only when the database itself fails.
    pub async fn release(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: ReleaseOutcome,
    ) -> Result<bool> {
        let _guard = self.db.write_guard().await;
        let now = to_db_time(self.db.now());
        let fallback = outcome.fallback_status().map(|s| s.as_str());
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let released = sqlx::query(
            "UPDATE tasks
             SET claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL,
                 status = CASE WHEN status = 'in_progress' THEN COALESCE(?, status) ELSE status END,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(fallback)
        .bind(&now)
        .bind(task_id.value())
        .bind(worker_id.to_db())
        .execute(&mut *tx)
        .await
        .map(|r| r.rows_affected() == 1)
        .map_err(db_error("release task"))?;

        if !released {
            tx.rollback().await.map_err(db_error("rollback tx"))?;
            return Ok(false);
        }

        close_open_claims(&mut tx, task_id, Some(worker_id), outcome, &now).await?;
        tx.commit().await.map_err(db_error("commit tx"))?;
        debug!(task_id = %task_id, worker_id = %worker_id, outcome = outcome.as_str(), "Task released");
        Ok(true)
    }

    /// Moves a claimed, in-progress task to a terminal status. Succeeds at most
    /// once per lifecycle.
    ///
    /// # Errors
    /// Returns `TaskError` for a non-terminal target status.
    pub async fn mark_terminal(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(SwarmError::TaskError(format!(
                "{status} is not a terminal status"
            )));
        }
        let _guard = self.db.write_guard().await;
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status = 'in_progress'",
        )
        .bind(status.as_str())
        .bind(to_db_time(self.db.now()))
        .bind(task_id.value())
        .bind(worker_id.to_db())
        .execute(self.db.pool())
        .await
        .map(|r| r.rows_affected() == 1)
        .map_err(db_error("mark task terminal"))?;

        if !updated {
            warn!(task_id = %task_id, worker_id = %worker_id, status = status.as_str(), "Terminal transition rejected");
        }
        Ok(updated)
    }

    /// Resets expired in-progress claims to `pending`.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn cleanup_stale_claims(&self) -> Result<u64> {
        let _guard = self.db.write_guard().await;
        let now = to_db_time(self.db.now());
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let expired = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM tasks
             WHERE status = 'in_progress' AND claim_expires_at IS NOT NULL AND claim_expires_at < ?",
        )
        .bind(&now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("find stale claims"))?;

        for id in &expired {
            reset_to_pending(&mut tx, TaskId::new(*id), &now).await?;
        }

        tx.commit().await.map_err(db_error("commit tx"))?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Reset stale claims to pending");
        }
        Ok(expired.len() as u64)
    }

    /// Dependencies naming task keys that do not exist.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn validate_dependencies(&self) -> Result<Vec<DanglingDependency>> {
        let statuses = self.status_by_key().await?;
        Ok(self
            .list(None)
            .await?
            .into_iter()
            .flat_map(|task| {
                task.depends_on
                    .iter()
                    .filter(|dep| !statuses.contains_key(dep.value()))
                    .map(|dep| DanglingDependency {
                        task_key: task.task_key.clone(),
                        missing: dep.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_by_status(&self, phase: Option<i64>) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM tasks WHERE (? IS NULL OR phase = ?) GROUP BY status",
        )
        .bind(phase)
        .bind(phase)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("count tasks"))?;

        let mut counts: StatusCounts = TaskStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for (status, count) in rows {
            let status = TaskStatus::try_from(status.as_str()).map_err(SwarmError::DatabaseError)?;
            counts.insert(status.as_str(), to_u64(count));
        }
        Ok(counts)
    }
}

pub(super) async fn reset_to_pending(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: TaskId,
    now: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks
         SET status = 'pending', claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL,
             version = version + 1, updated_at = ?
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(now)
    .bind(task_id.value())
    .execute(&mut **tx)
    .await
    .map_err(db_error("reset stale task"))?;

    sqlx::query("UPDATE workers SET current_task_id = NULL WHERE current_task_id = ?")
        .bind(task_id.value())
        .execute(&mut **tx)
        .await
        .map_err(db_error("detach worker from task"))?;

    close_open_claims(tx, task_id, None, ReleaseOutcome::Timeout, now).await
}

async fn close_open_claims(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: TaskId,
    worker_id: Option<WorkerId>,
    outcome: ReleaseOutcome,
    now: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_claims
         SET released_at = ?, outcome = ?
         WHERE task_id = ? AND (? IS NULL OR worker_id = ?) AND released_at IS NULL",
    )
    .bind(now)
    .bind(outcome.as_str())
    .bind(task_id.value())
    .bind(worker_id.map(|w| w.to_db()))
    .bind(worker_id.map(|w| w.to_db()))
    .execute(&mut **tx)
    .await
    .map(|_| ())
    .map_err(db_error("close claim audit row"))
}
