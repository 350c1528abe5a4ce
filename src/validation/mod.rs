//! Gates between phases, end-of-run validation and dependency-graph checks.

mod graph;
mod phase_gate;
mod run_validation;

pub use graph::{dependency_order, DependencyCycle};
pub use phase_gate::PhaseGateValidator;
pub use run_validation::{find_orphans, RunValidator};

use crate::db::SwarmDb;
use crate::error::{Result, SwarmError};
use crate::ports::RegressionRunner;
use crate::types::{CheckOutcome, DanglingDependency, NewTask, RegressionFailure, TaskKey};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Runs `test_files` as one batch and, only when the batch fails, once per
/// file to name the culprits. A runner error counts as a failed run.
pub(crate) async fn attribute_regressions(
    runner: &dyn RegressionRunner,
    test_files: &[String],
) -> Vec<RegressionFailure> {
    if test_files.is_empty() {
        return Vec::new();
    }

    let batch = run_checked(runner, test_files).await;
    if batch.passed {
        return Vec::new();
    }
    debug!(files = test_files.len(), "Regression batch failed; attributing per file");

    let mut failures = Vec::new();
    for file in test_files {
        let single = run_checked(runner, std::slice::from_ref(file)).await;
        if !single.passed {
            failures.push(RegressionFailure {
                test_file: file.clone(),
                output: single.output,
            });
        }
    }
    if failures.is_empty() {
        // every file passes alone; the batch failure is an interaction
        failures.push(RegressionFailure {
            test_file: "(batch)".to_string(),
            output: batch.output,
        });
    }
    failures
}

async fn run_checked(runner: &dyn RegressionRunner, test_files: &[String]) -> CheckOutcome {
    runner
        .run(test_files)
        .await
        .unwrap_or_else(|e| CheckOutcome::fail(format!("regression runner failed: {e}")))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub dangling: Vec<DanglingDependency>,
    pub cycle: Option<DependencyCycle>,
}

impl DependencyReport {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.dangling.is_empty() && self.cycle.is_none()
    }
}

/// Dangling edges and cycles across every stored task.
///
/// # Errors
/// Returns an error if the store fails.
pub async fn check_stored_dependencies(db: &SwarmDb) -> Result<DependencyReport> {
    let dangling = db.tasks().validate_dependencies().await?;
    let tasks = db.tasks().list(None).await?;
    let cycle = dependency_order(tasks.iter().map(|t| (&t.task_key, t.depends_on.as_slice()))).err();
    Ok(DependencyReport { dangling, cycle })
}

/// Rejects an import batch with duplicate keys, dependencies on keys that
/// exist neither in the batch nor in `existing`, dependencies on a later
/// phase, or cycles. Returns the batch in dependency order.
///
/// # Errors
/// Returns [`SwarmError::TaskError`] describing the first problem class found.
pub fn check_import(tasks: &[NewTask], existing: &HashSet<TaskKey>) -> Result<Vec<TaskKey>> {
    let mut seen = HashSet::new();
    let duplicates: Vec<&str> = tasks
        .iter()
        .filter(|t| !seen.insert(&t.task_key) || existing.contains(&t.task_key))
        .map(|t| t.task_key.value())
        .collect();
    if !duplicates.is_empty() {
        return Err(SwarmError::TaskError(format!(
            "duplicate task keys: {}",
            duplicates.join(", ")
        )));
    }

    let seen = &seen;
    let dangling: Vec<String> = tasks
        .iter()
        .flat_map(move |t| {
            t.depends_on
                .iter()
                .filter(move |dep| !seen.contains(dep) && !existing.contains(*dep))
                .map(move |dep| format!("{} -> {}", t.task_key, dep))
        })
        .collect();
    if !dangling.is_empty() {
        return Err(SwarmError::TaskError(format!(
            "unknown dependencies: {}",
            dangling.join(", ")
        )));
    }

    let backwards: Vec<String> = tasks
        .iter()
        .flat_map(move |t| {
            t.depends_on.iter().filter_map(move |dep| {
                tasks
                    .iter()
                    .find(|other| &other.task_key == dep)
                    .filter(|other| other.phase > t.phase)
                    .map(|other| format!("{} (phase {}) -> {} (phase {})", t.task_key, t.phase, dep, other.phase))
            })
        })
        .collect();
    if !backwards.is_empty() {
        return Err(SwarmError::TaskError(format!(
            "dependencies on later phases: {}",
            backwards.join(", ")
        )));
    }

    dependency_order(tasks.iter().map(|t| (&t.task_key, t.depends_on.as_slice())))
        .map_err(|cycle| SwarmError::TaskError(cycle.to_string()))
}
