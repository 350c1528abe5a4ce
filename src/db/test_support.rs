#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use super::SwarmDb;
use crate::clock::ManualClock;
use crate::types::{NewTask, TaskId};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

pub fn test_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
}

pub async fn memory_db() -> (SwarmDb, ManualClock) {
    let clock = test_clock();
    let db = SwarmDb::in_memory(Arc::new(clock.clone()))
        .await
        .unwrap_or_else(|e| panic!("in-memory db failed: {e}"));
    (db, clock)
}

/// On-disk database with a real multi-connection pool, for contention tests.
pub async fn file_db() -> (SwarmDb, ManualClock, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let clock = test_clock();
    let db = SwarmDb::open_with_clock(&dir.path().join("swarm.db"), Arc::new(clock.clone()))
        .await
        .unwrap_or_else(|e| panic!("file db failed: {e}"));
    (db, clock, dir)
}

pub async fn seed(db: &SwarmDb, tasks: &[NewTask]) -> Vec<TaskId> {
    db.tasks()
        .insert_many(tasks)
        .await
        .unwrap_or_else(|e| panic!("seed failed: {e}"))
}
