use super::attribute_regressions;
use crate::db::SwarmDb;
use crate::error::Result;
use crate::ports::RegressionRunner;
use crate::types::{IncompleteTask, PhaseGateResult, TaskStatus};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{info, warn};

/// Decides whether a phase may start: every earlier task must be terminal and
/// the tests of every completed earlier task must still pass.
#[derive(Clone)]
pub struct PhaseGateValidator {
    db: SwarmDb,
    regression: Arc<dyn RegressionRunner>,
}

impl PhaseGateValidator {
    #[must_use]
    pub fn new(db: SwarmDb, regression: Arc<dyn RegressionRunner>) -> Self {
        Self { db, regression }
    }

    /// Both failure categories are collected before returning.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn validate_phase(&self, phase: i64) -> Result<PhaseGateResult> {
        let prior = self.db.tasks().list_before_phase(phase).await?;
        if prior.is_empty() {
            return Ok(PhaseGateResult::trivial_pass(phase));
        }

        let incomplete_tasks: Vec<IncompleteTask> = prior
            .iter()
            .filter(|task| !task.status.is_terminal())
            .map(|task| IncompleteTask {
                task_key: task.task_key.clone(),
                status: task.status,
            })
            .collect();

        let test_files: Vec<String> = prior
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Complete | TaskStatus::Passing))
            .map(|task| task.test_file.clone())
            .unique()
            .collect();
        let regression_failures = attribute_regressions(self.regression.as_ref(), &test_files).await;

        let passed = incomplete_tasks.is_empty() && regression_failures.is_empty();
        let result = PhaseGateResult {
            phase,
            passed,
            incomplete_tasks,
            regression_failures,
        };
        if passed {
            info!(phase, checked_files = test_files.len(), "Phase gate passed");
        } else {
            warn!(phase, summary = %result.summary(), "Phase gate failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::PhaseGateValidator;
    use crate::db::test_support::{memory_db, seed};
    use crate::db::SwarmDb;
    use crate::error::SwarmError;
    use crate::ports::{PortFuture, RegressionRunner};
    use crate::types::{CheckOutcome, NewTask, ReleaseOutcome, TaskKey, TaskStatus, WorkerId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fails any batch containing one of `failing`; records every batch run.
    #[derive(Default)]
    struct RecordingRunner {
        failing: Vec<String>,
        crash: bool,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RegressionRunner for RecordingRunner {
        fn run<'a>(&'a self, test_files: &'a [String]) -> PortFuture<'a, CheckOutcome> {
            Box::pin(async move {
                self.batches.lock().unwrap().push(test_files.to_vec());
                if self.crash {
                    return Err(SwarmError::CollaboratorError("pytest not found".to_string()));
                }
                let failed: Vec<&String> = test_files.iter().filter(|f| self.failing.contains(f)).collect();
                Ok(if failed.is_empty() {
                    CheckOutcome::pass("ok")
                } else {
                    CheckOutcome::fail(format!("FAILED {failed:?}"))
                })
            })
        }
    }

    async fn finish(db: &SwarmDb, key: &str, status: TaskStatus) {
        let task = db.tasks().get_by_key(&TaskKey::new(key)).await.unwrap().unwrap();
        let worker = WorkerId::new(1);
        assert!(db.tasks().claim(task.id, worker, Duration::from_secs(60)).await.unwrap());
        assert!(db.tasks().mark_terminal(task.id, worker, status).await.unwrap());
        db.tasks().release(task.id, worker, ReleaseOutcome::Completed).await.unwrap();
    }

    async fn two_phase_db() -> SwarmDb {
        let (db, _clock) = memory_db().await;
        seed(
            &db,
            &[
                NewTask::new("P1-A", 1, "tests/test_a.py", "src/a.py"),
                NewTask::new("P1-B", 1, "tests/test_b.py", "src/b.py"),
                NewTask::new("P2-C", 2, "tests/test_c.py", "src/c.py").depending_on(["P1-A"]),
            ],
        )
        .await;
        db
    }

    mod when_the_phase_has_no_predecessors {
        use super::*;

        #[tokio::test]
        async fn then_the_gate_passes_without_running_tests() {
            let db = two_phase_db().await;
            let runner = Arc::new(RecordingRunner::default());
            let gate = PhaseGateValidator::new(db, runner.clone());

            let result = gate.validate_phase(1).await.unwrap();

            assert!(result.passed);
            assert!(runner.batches.lock().unwrap().is_empty());
        }
    }

    mod when_all_prior_tasks_completed_cleanly {
        use super::*;

        #[tokio::test]
        async fn then_one_batch_run_is_enough() {
            let db = two_phase_db().await;
            finish(&db, "P1-A", TaskStatus::Complete).await;
            finish(&db, "P1-B", TaskStatus::Complete).await;
            let runner = Arc::new(RecordingRunner::default());
            let gate = PhaseGateValidator::new(db, runner.clone());

            let result = gate.validate_phase(2).await.unwrap();

            assert!(result.passed, "{}", result.summary());
            assert_eq!(runner.batches.lock().unwrap().len(), 1);
        }
    }

    mod when_a_prior_task_regressed_and_another_is_unfinished {
        use super::*;

        #[tokio::test]
        async fn then_both_problems_are_reported_with_the_failing_file() {
            // Given
            let db = two_phase_db().await;
            finish(&db, "P1-A", TaskStatus::Complete).await;
            let runner = Arc::new(RecordingRunner {
                failing: vec!["tests/test_a.py".to_string()],
                ..RecordingRunner::default()
            });
            let gate = PhaseGateValidator::new(db, runner.clone());

            // When
            let result = gate.validate_phase(2).await.unwrap();

            // Then
            assert!(!result.passed);
            assert_eq!(result.incomplete_tasks.len(), 1);
            assert_eq!(result.incomplete_tasks[0].task_key.value(), "P1-B");
            assert_eq!(result.regression_failures.len(), 1);
            assert_eq!(result.regression_failures[0].test_file, "tests/test_a.py");
            // batch, then one run per file
            assert_eq!(runner.batches.lock().unwrap().len(), 2);
        }
    }

    mod when_the_runner_itself_fails {
        use super::*;

        #[tokio::test]
        async fn then_the_gate_fails_instead_of_erroring() {
            let db = two_phase_db().await;
            finish(&db, "P1-A", TaskStatus::Complete).await;
            finish(&db, "P1-B", TaskStatus::Blocked).await;
            let runner = Arc::new(RecordingRunner {
                crash: true,
                ..RecordingRunner::default()
            });
            let gate = PhaseGateValidator::new(db, runner);

            let result = gate.validate_phase(2).await.unwrap();

            assert!(!result.passed);
            assert!(result.incomplete_tasks.is_empty(), "blocked is terminal");
            assert!(result.regression_failures[0].output.contains("pytest not found"));
        }
    }
}
