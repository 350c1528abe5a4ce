mod audit_repo;
mod circuit_repo;
mod mappers;
mod run_repo;
mod task_repo;
mod worker_repo;

#[cfg(test)]
mod claim_behaviors;
#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod worker_lifecycle_behaviors;

pub use audit_repo::{AuditRepository, ClaimAuditRecord, StageAttemptEntry, StageAttemptRecord};
pub use circuit_repo::CircuitRepository;
pub use mappers::{from_db_time, to_db_time};
pub use run_repo::RunRepository;
pub use task_repo::{StatusCounts, TaskRepository};
pub use worker_repo::{ReclaimReport, WorkerRepository};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SwarmError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = include_str!("schema.sql");

/// Handle to the shared store. Cloning is cheap; clones share the pool, the
/// writer lock and the clock.
#[derive(Clone)]
pub struct SwarmDb {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SwarmDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmDb").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl SwarmDb {
    /// Opens (creating if needed) the database file and applies the schema.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the file cannot be opened.
    pub async fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(resolve_pool_max_connections())
            .connect_with(options)
            .await
            .map_err(|e| SwarmError::DatabaseError(format!("Failed to open database: {e}")))?;

        let db = Self::new_with_pool(pool, clock);
        db.init_schema().await?;
        info!(path = %path.display(), "Opened swarm database");
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps every query on the
    /// same memory image.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the database cannot be created.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SwarmError::DatabaseError(format!("Invalid sqlite options: {e}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| SwarmError::DatabaseError(format!("Failed to open database: {e}")))?;

        let db = Self::new_with_pool(pool, clock);
        db.init_schema().await?;
        Ok(db)
    }

    #[must_use]
    pub fn new_with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            clock,
        }
    }

    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when a DDL statement fails.
    pub async fn init_schema(&self) -> Result<()> {
        let _guard = self.write_guard().await;
        sqlx::raw_sql(SCHEMA)
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(|e| SwarmError::DatabaseError(format!("Failed to apply schema: {e}")))
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Every mutating statement runs while holding this guard.
    pub(crate) async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    #[must_use]
    pub const fn tasks(&self) -> TaskRepository<'_> {
        TaskRepository::new(self)
    }

    #[must_use]
    pub const fn workers(&self) -> WorkerRepository<'_> {
        WorkerRepository::new(self)
    }

    #[must_use]
    pub const fn runs(&self) -> RunRepository<'_> {
        RunRepository::new(self)
    }

    #[must_use]
    pub const fn circuits(&self) -> CircuitRepository<'_> {
        CircuitRepository::new(self)
    }

    #[must_use]
    pub const fn audit(&self) -> AuditRepository<'_> {
        AuditRepository::new(self)
    }
}

pub(crate) fn db_error(action: &str) -> impl FnOnce(sqlx::Error) -> SwarmError + '_ {
    move |e| SwarmError::DatabaseError(format!("Failed to {action}: {e}"))
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn lease_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn resolve_pool_max_connections() -> u32 {
    resolve_pool_max_connections_from(|key| std::env::var(key).ok())
}

fn resolve_pool_max_connections_from<F>(env_lookup: F) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup("SWARM_DB_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            let worker_count = env_lookup("SWARM_MAX_WORKERS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(2);

            8_u32.max(worker_count.saturating_mul(2) + 2)
        })
}

#[cfg(test)]
mod tests {
    use super::resolve_pool_max_connections_from;
    use std::collections::HashMap;

    fn lookup(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).cloned()
    }

    #[test]
    fn pool_size_scales_with_workers_above_a_floor() {
        assert_eq!(resolve_pool_max_connections_from(lookup(HashMap::new())), 8);
        assert_eq!(
            resolve_pool_max_connections_from(lookup(HashMap::from([(
                "SWARM_MAX_WORKERS".to_string(),
                "10".to_string(),
            )]))),
            22
        );
    }

    #[test]
    fn explicit_pool_override_wins_over_computed_value() {
        assert_eq!(
            resolve_pool_max_connections_from(lookup(HashMap::from([
                ("SWARM_MAX_WORKERS".to_string(), "20".to_string()),
                ("SWARM_DB_MAX_CONNECTIONS".to_string(), "4".to_string()),
            ]))),
            4
        );
    }
}
