use super::mappers::{to_db_time, to_u32, WorkerRow};
use super::task_repo::reset_to_pending;
use super::{db_error, lease_cutoff, lease_deadline, SwarmDb};
use crate::error::Result;
use crate::types::{TaskId, WorkerId, WorkerRecord};
use std::time::Duration;
use tracing::{info, warn};

/// Workers marked dead and the tasks handed back to `pending`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub workers: Vec<WorkerId>,
    pub tasks_reset: u64,
}

pub struct WorkerRepository<'a> {
    db: &'a SwarmDb,
}

impl<'a> WorkerRepository<'a> {
    pub(crate) const fn new(db: &'a SwarmDb) -> Self {
        Self { db }
    }

    /// Reserves `count` worker ids no earlier process has used, neither as a
    /// registered worker nor as a claim holder, and registers them idle.
    ///
    /// # Errors
    /// Returns an error if the lookup or any insert fails; nothing is reserved
    /// in that case.
    pub async fn reserve(&self, count: u32) -> Result<Vec<WorkerId>> {
        let _guard = self.db.write_guard().await;
        let now = to_db_time(self.db.now());
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let highest = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(id), 0) FROM (
                 SELECT worker_id AS id FROM workers
                 UNION ALL SELECT claimed_by FROM tasks WHERE claimed_by IS NOT NULL
                 UNION ALL SELECT worker_id FROM task_claims
             )",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("find highest worker id"))?;

        let first = to_u32(highest).saturating_add(1);
        let ids: Vec<WorkerId> = (0..count)
            .map(|offset| WorkerId::new(first.saturating_add(offset)))
            .collect();
        for id in &ids {
            sqlx::query(
                "INSERT INTO workers (worker_id, status, last_heartbeat, current_task_id, registered_at)
                 VALUES (?, 'idle', ?, NULL, ?)",
            )
            .bind(id.to_db())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_error("reserve worker id"))?;
        }

        tx.commit().await.map_err(db_error("commit tx"))?;
        Ok(ids)
    }

    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn register(&self, worker_id: WorkerId) -> Result<()> {
        let _guard = self.db.write_guard().await;
        let now = to_db_time(self.db.now());
        sqlx::query(
            "INSERT INTO workers (worker_id, status, last_heartbeat, current_task_id, registered_at)
             VALUES (?, 'idle', ?, NULL, ?)
             ON CONFLICT (worker_id) DO UPDATE
             SET status = 'idle', last_heartbeat = excluded.last_heartbeat,
                 current_task_id = NULL, registered_at = excluded.registered_at",
        )
        .bind(worker_id.to_db())
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map(|_| ())
        .map_err(db_error("register worker"))
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn unregister(&self, worker_id: WorkerId) -> Result<bool> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM workers WHERE worker_id = ?")
            .bind(worker_id.to_db())
            .execute(self.db.pool())
            .await
            .map(|r| r.rows_affected() > 0)
            .map_err(db_error("unregister worker"))
    }

    /// Refreshes the worker's heartbeat and extends the lease on the task it is
    /// currently working on. Claims recorded under the same id that the worker
    /// is not working on keep their deadline and expire normally. Returns
    /// `false` when the worker is unknown or already declared dead.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn heartbeat(&self, worker_id: WorkerId, lease: Duration) -> Result<bool> {
        let _guard = self.db.write_guard().await;
        let now = self.db.now();
        let now_text = to_db_time(now);
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let alive = sqlx::query(
            "UPDATE workers SET last_heartbeat = ? WHERE worker_id = ? AND status != 'dead'",
        )
        .bind(&now_text)
        .bind(worker_id.to_db())
        .execute(&mut *tx)
        .await
        .map(|r| r.rows_affected() == 1)
        .map_err(db_error("record heartbeat"))?;

        if alive {
            sqlx::query(
                "UPDATE tasks SET claim_expires_at = ?
                 WHERE claimed_by = ? AND status = 'in_progress'
                   AND id = (SELECT current_task_id FROM workers WHERE worker_id = ?)",
            )
            .bind(to_db_time(lease_deadline(now, lease)))
            .bind(worker_id.to_db())
            .bind(worker_id.to_db())
            .execute(&mut *tx)
            .await
            .map_err(db_error("extend claim lease"))?;
        }

        tx.commit().await.map_err(db_error("commit tx"))?;
        Ok(alive)
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_idle(&self, worker_id: WorkerId) -> Result<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "UPDATE workers SET status = 'idle', current_task_id = NULL
             WHERE worker_id = ? AND status != 'dead'",
        )
        .bind(worker_id.to_db())
        .execute(self.db.pool())
        .await
        .map(|_| ())
        .map_err(db_error("mark worker idle"))
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get(&self, worker_id: WorkerId) -> Result<Option<WorkerRecord>> {
        sqlx::query_as::<_, WorkerRow>(
            "SELECT worker_id, status, last_heartbeat, current_task_id FROM workers WHERE worker_id = ?",
        )
        .bind(worker_id.to_db())
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("load worker"))?
        .map(WorkerRecord::try_from)
        .transpose()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn list(&self) -> Result<Vec<WorkerRecord>> {
        sqlx::query_as::<_, WorkerRow>(
            "SELECT worker_id, status, last_heartbeat, current_task_id FROM workers ORDER BY worker_id",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("list workers"))?
        .into_iter()
        .map(WorkerRecord::try_from)
        .collect()
    }

    /// Live workers whose last heartbeat is older than `threshold`.
    ///
    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn stale_workers(&self, threshold: Duration) -> Result<Vec<WorkerRecord>> {
        let cutoff = to_db_time(lease_cutoff(self.db.now(), threshold));
        sqlx::query_as::<_, WorkerRow>(
            "SELECT worker_id, status, last_heartbeat, current_task_id FROM workers
             WHERE status != 'dead' AND last_heartbeat < ?
             ORDER BY worker_id",
        )
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("find stale workers"))?
        .into_iter()
        .map(WorkerRecord::try_from)
        .collect()
    }

    /// Marks stale workers dead and returns their in-progress tasks to `pending`.
    ///
    /// # Errors
    /// Returns an error if any update fails; nothing is applied in that case.
    pub async fn reclaim_stale_workers(&self, threshold: Duration) -> Result<ReclaimReport> {
        let _guard = self.db.write_guard().await;
        let now = self.db.now();
        let now_text = to_db_time(now);
        let cutoff = to_db_time(lease_cutoff(now, threshold));
        let mut tx = self.db.pool().begin().await.map_err(db_error("begin tx"))?;

        let stale = sqlx::query_scalar::<_, i64>(
            "SELECT worker_id FROM workers WHERE status != 'dead' AND last_heartbeat < ?",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("find stale workers"))?;

        let mut report = ReclaimReport::default();
        for worker in stale {
            sqlx::query("UPDATE workers SET status = 'dead', current_task_id = NULL WHERE worker_id = ?")
                .bind(worker)
                .execute(&mut *tx)
                .await
                .map_err(db_error("mark worker dead"))?;

            let held = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM tasks WHERE claimed_by = ? AND status = 'in_progress'",
            )
            .bind(worker)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("find tasks held by stale worker"))?;

            for task_id in &held {
                reset_to_pending(&mut tx, TaskId::new(*task_id), &now_text).await?;
            }

            let worker_id = WorkerId::new(to_u32(worker));
            warn!(worker_id = %worker_id, tasks = held.len(), "Reclaimed stale worker");
            report.workers.push(worker_id);
            report.tasks_reset += held.len() as u64;
        }

        tx.commit().await.map_err(db_error("commit tx"))?;
        if !report.workers.is_empty() {
            info!(workers = report.workers.len(), tasks = report.tasks_reset, "Stale worker sweep done");
        }
        Ok(report)
    }
}
