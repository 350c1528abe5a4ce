use super::mappers::{parse_circuit, to_db_time, CircuitRow};
use super::{db_error, SwarmDb};
use crate::error::Result;
use crate::types::{CircuitBreakerRecord, CircuitConfig, CircuitLevel};

const CIRCUIT_COLUMNS: &str =
    "level, identifier, state, failure_count, success_count, opened_at, updated_at, version";

pub struct CircuitRepository<'a> {
    db: &'a SwarmDb,
}

impl<'a> CircuitRepository<'a> {
    pub(crate) const fn new(db: &'a SwarmDb) -> Self {
        Self { db }
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn get(
        &self,
        level: CircuitLevel,
        identifier: &str,
        config: CircuitConfig,
    ) -> Result<Option<CircuitBreakerRecord>> {
        sqlx::query_as::<_, CircuitRow>(&format!(
            "SELECT {CIRCUIT_COLUMNS} FROM circuit_breakers WHERE level = ? AND identifier = ?"
        ))
        .bind(level.as_str())
        .bind(identifier)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("load circuit breaker"))?
        .map(|row| parse_circuit(row, config))
        .transpose()
    }

    /// # Errors
    /// Returns an error if the query or row mapping fails.
    pub async fn list(&self, config: CircuitConfig) -> Result<Vec<CircuitBreakerRecord>> {
        sqlx::query_as::<_, CircuitRow>(&format!(
            "SELECT {CIRCUIT_COLUMNS} FROM circuit_breakers ORDER BY level, identifier"
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(db_error("list circuit breakers"))?
        .into_iter()
        .map(|row| parse_circuit(row, config))
        .collect()
    }

    /// Persists `record` if nobody else wrote the row since it was read.
    /// `record.version` is the version that was read (0 for a new breaker);
    /// returns `false` on a version conflict.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn save(&self, record: &CircuitBreakerRecord) -> Result<bool> {
        let _guard = self.db.write_guard().await;
        let opened_at = record.opened_at.map(to_db_time);
        let updated_at = to_db_time(record.updated_at);

        // Both statements bind the same leading columns; only UPDATE checks the version.
        let query = if record.version == 0 {
            sqlx::query(
                "INSERT INTO circuit_breakers
                     (state, failure_count, success_count, opened_at, updated_at, version, level, identifier)
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT (level, identifier) DO NOTHING",
            )
        } else {
            sqlx::query(
                "UPDATE circuit_breakers
                 SET state = ?, failure_count = ?, success_count = ?, opened_at = ?, updated_at = ?,
                     version = version + 1
                 WHERE level = ? AND identifier = ? AND version = ?",
            )
        };

        let query = query
            .bind(record.state.as_str())
            .bind(i64::from(record.failure_count))
            .bind(i64::from(record.success_count))
            .bind(opened_at)
            .bind(updated_at)
            .bind(record.level.as_str())
            .bind(record.identifier.clone());
        let query = if record.version == 0 {
            query
        } else {
            query.bind(record.version)
        };

        query
            .execute(self.db.pool())
            .await
            .map(|r| r.rows_affected() == 1)
            .map_err(db_error("save circuit breaker"))
    }

    /// Deletes matching breakers; the next read starts closed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn reset(&self, level: Option<CircuitLevel>, identifier: Option<&str>) -> Result<u64> {
        let _guard = self.db.write_guard().await;
        let level = level.map(|l| l.as_str());
        sqlx::query(
            "DELETE FROM circuit_breakers
             WHERE (? IS NULL OR level = ?) AND (? IS NULL OR identifier = ?)",
        )
        .bind(level)
        .bind(level)
        .bind(identifier)
        .bind(identifier)
        .execute(self.db.pool())
        .await
        .map(|r| r.rows_affected())
        .map_err(db_error("reset circuit breakers"))
    }
}
