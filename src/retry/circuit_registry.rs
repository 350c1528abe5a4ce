use crate::db::SwarmDb;
use crate::error::{Result, SwarmError};
use crate::types::{CircuitBreakerRecord, CircuitConfig, CircuitLevel, CircuitState};
use serde::Serialize;
use tracing::{info, warn};

const MAX_SAVE_RETRIES: usize = 5;

/// Breaker counts by state, for `circuits health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitHealth {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

impl CircuitHealth {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.open == 0
    }
}

/// Persistent breakers keyed by `(level, identifier)`, updated with
/// optimistic version checks so concurrent workers never lose a transition.
#[derive(Clone)]
pub struct CircuitRegistry {
    db: SwarmDb,
    config: CircuitConfig,
}

impl CircuitRegistry {
    #[must_use]
    pub const fn new(db: SwarmDb, config: CircuitConfig) -> Self {
        Self { db, config }
    }

    /// Whether calls guarded by this breaker may proceed. An open breaker
    /// whose cooldown elapsed is moved to half-open first.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn allows(&self, level: CircuitLevel, identifier: &str) -> Result<bool> {
        let record = self
            .update(level, identifier, |record, now| record.try_half_open(now))
            .await?;
        Ok(record.state.allows_operations())
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record_success(&self, level: CircuitLevel, identifier: &str) -> Result<CircuitState> {
        let before = self.current(level, identifier).await?.map(|r| r.state);
        let record = self
            .update(level, identifier, |record, now| record.record_success(now))
            .await?;
        if before == Some(CircuitState::HalfOpen) && record.state == CircuitState::Closed {
            info!(level = %level, identifier, "Circuit closed");
        }
        Ok(record.state)
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn record_failure(&self, level: CircuitLevel, identifier: &str) -> Result<CircuitState> {
        let record = self
            .update(level, identifier, |record, now| record.record_failure(now))
            .await?;
        if record.state == CircuitState::Open && record.opened_at == Some(record.updated_at) {
            warn!(level = %level, identifier, failures = record.failure_count, "Circuit opened");
        }
        Ok(record.state)
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn status(&self) -> Result<Vec<CircuitBreakerRecord>> {
        let now = self.db.now();
        Ok(self
            .db
            .circuits()
            .list(self.config)
            .await?
            .into_iter()
            .map(|record| record.try_half_open(now))
            .collect())
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn health(&self) -> Result<CircuitHealth> {
        Ok(self
            .status()
            .await?
            .iter()
            .fold(CircuitHealth::default(), |mut health, record| {
                match record.state {
                    CircuitState::Closed => health.closed += 1,
                    CircuitState::Open => health.open += 1,
                    CircuitState::HalfOpen => health.half_open += 1,
                }
                health
            }))
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn reset(&self, level: Option<CircuitLevel>, identifier: Option<&str>) -> Result<u64> {
        let removed = self.db.circuits().reset(level, identifier).await?;
        info!(removed, "Circuit breakers reset");
        Ok(removed)
    }

    async fn current(
        &self,
        level: CircuitLevel,
        identifier: &str,
    ) -> Result<Option<CircuitBreakerRecord>> {
        self.db.circuits().get(level, identifier, self.config).await
    }

    async fn update<F>(&self, level: CircuitLevel, identifier: &str, transition: F) -> Result<CircuitBreakerRecord>
    where
        F: Fn(CircuitBreakerRecord, chrono::DateTime<chrono::Utc>) -> CircuitBreakerRecord,
    {
        for _ in 0..MAX_SAVE_RETRIES {
            let now = self.db.now();
            let loaded = self.current(level, identifier).await?.unwrap_or_else(|| {
                CircuitBreakerRecord::new(level, identifier, self.config, now)
            });
            let read_version = loaded.version;
            let next = transition(loaded.clone(), now);
            if next == loaded {
                return Ok(next);
            }
            if self.db.circuits().save(&next).await? {
                return Ok(CircuitBreakerRecord {
                    version: read_version + 1,
                    ..next
                });
            }
        }
        Err(SwarmError::DatabaseError(format!(
            "Circuit {level}/{identifier} kept changing under concurrent updates"
        )))
    }
}
