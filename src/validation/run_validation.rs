use super::attribute_regressions;
use crate::db::SwarmDb;
use crate::error::Result;
use crate::ports::{ProjectChecker, RegressionRunner};
use crate::types::{
    CheckOutcome, OrphanedTask, RunValidationResult, Task, TaskStatus, WorkerId, WorkerRecord,
    WorkerStatus,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// End-of-run checks over the integrated tree and the task table.
#[derive(Clone)]
pub struct RunValidator {
    db: SwarmDb,
    regression: Arc<dyn RegressionRunner>,
    checker: Arc<dyn ProjectChecker>,
}

impl RunValidator {
    #[must_use]
    pub fn new(db: SwarmDb, regression: Arc<dyn RegressionRunner>, checker: Arc<dyn ProjectChecker>) -> Self {
        Self {
            db,
            regression,
            checker,
        }
    }

    /// # Errors
    /// Returns an error if the store fails. Failing checks are reported in
    /// the result, not as errors.
    pub async fn validate_run(&self) -> Result<RunValidationResult> {
        let tasks = self.db.tasks().list(None).await?;
        let workers = self.db.workers().list().await?;

        let test_files: Vec<String> = tasks
            .iter()
            .filter(|t| t.status.satisfies_dependency())
            .map(|t| t.test_file.clone())
            .unique()
            .collect();

        let (regression_failures, lint, typecheck) = tokio::join!(
            attribute_regressions(self.regression.as_ref(), &test_files),
            self.checker.lint(),
            self.checker.typecheck(),
        );
        let lint = lint.unwrap_or_else(|e| CheckOutcome::fail(format!("lint failed to run: {e}")));
        let typecheck =
            typecheck.unwrap_or_else(|e| CheckOutcome::fail(format!("typecheck failed to run: {e}")));
        let orphaned_tasks = find_orphans(&tasks, &workers, self.db.now());

        let result = RunValidationResult {
            passed: regression_failures.is_empty() && lint.passed && typecheck.passed && orphaned_tasks.is_empty(),
            regression_failures,
            lint_passed: lint.passed,
            lint_output: lint.output,
            typecheck_passed: typecheck.passed,
            typecheck_output: typecheck.output,
            orphaned_tasks,
        };
        if result.passed {
            info!(checked_files = test_files.len(), "Run validation passed");
        } else {
            warn!(summary = %result.summary(), "Run validation failed");
        }
        Ok(result)
    }
}

/// Non-terminal tasks that cannot move without intervention: in-progress
/// tasks whose claim expired or whose holder is gone, and pending tasks that
/// wait on a missing or blocked dependency.
#[must_use]
pub fn find_orphans(tasks: &[Task], workers: &[WorkerRecord], now: DateTime<Utc>) -> Vec<OrphanedTask> {
    let status_by_key: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.task_key.value(), t.status)).collect();
    let worker_status: HashMap<_, _> = workers.iter().map(|w| (w.worker_id, w.status)).collect();

    tasks
        .iter()
        .filter_map(|task| {
            let reason = match task.status {
                TaskStatus::InProgress => in_progress_problem(task, &worker_status, now),
                TaskStatus::Pending => pending_problem(task, &status_by_key),
                _ => None,
            }?;
            Some(OrphanedTask {
                task_key: task.task_key.clone(),
                status: task.status,
                reason,
            })
        })
        .collect()
}

fn in_progress_problem(
    task: &Task,
    worker_status: &HashMap<WorkerId, WorkerStatus>,
    now: DateTime<Utc>,
) -> Option<String> {
    let Some(holder) = task.claimed_by else {
        return Some("in progress without a claim".to_string());
    };
    if task.claim_expires_at.is_some_and(|expires| expires < now) {
        return Some(format!("claim held by {holder} expired"));
    }
    match worker_status.get(&holder) {
        None => Some(format!("claimed by unregistered {holder}")),
        Some(WorkerStatus::Dead) => Some(format!("claimed by dead {holder}")),
        Some(_) => None,
    }
}

fn pending_problem(task: &Task, status_by_key: &HashMap<&str, TaskStatus>) -> Option<String> {
    task.depends_on.iter().find_map(|dep| match status_by_key.get(dep.value()) {
        None => Some(format!("depends on unknown task {dep}")),
        Some(status) if status.is_blocked() => Some(format!("depends on {status} task {dep}")),
        Some(_) => None,
    })
}
