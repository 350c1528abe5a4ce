// BDD-style tests for the worker boundary: claim, settle, release, and
// recovery from errors and panics.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use super::{TaskDisposition, Worker, WorkerSettings};
use crate::adapters::{ScriptedProject, TaskScript};
use crate::config::RefactorThresholds;
use crate::db::test_support::{memory_db, seed};
use crate::db::SwarmDb;
use crate::pipeline::{PipelineOutcome, PipelineRunner, PipelineSettings};
use crate::pool::InvocationBudget;
use crate::ports::BranchMode;
use crate::retry::{CircuitRegistry, StaticReviewCircuitBreaker};
use crate::types::{
    CircuitConfig, CircuitLevel, NewTask, ReleaseOutcome, Stage, Task, TaskStatus, WorkerId,
    WorkerStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn settings(branch_mode: BranchMode, restore_on_failure: bool) -> WorkerSettings {
    WorkerSettings {
        claim_timeout: Duration::from_secs(600),
        heartbeat_interval: Duration::from_secs(30),
        branch_mode,
        restore_on_failure,
    }
}

struct Fixture {
    db: SwarmDb,
    project: ScriptedProject,
    circuits: CircuitRegistry,
    worker: Worker,
}

async fn fixture(worker_settings: WorkerSettings, ceiling: u64) -> Fixture {
    let (db, clock) = memory_db().await;
    let project = ScriptedProject::new();
    let collaborators = project.collaborators();
    let circuits = CircuitRegistry::new(db.clone(), CircuitConfig::new(3, 1, 60));
    let pipeline = PipelineRunner::new(
        db.clone(),
        collaborators.clone(),
        circuits.clone(),
        Arc::new(StaticReviewCircuitBreaker::new(3, Duration::from_secs(300), Arc::new(clock))),
        Arc::new(InvocationBudget::new(ceiling, 0.8)),
        PipelineSettings {
            max_green_attempts: 2,
            green_retry_delay: Duration::ZERO,
            max_green_retry_time: Duration::from_secs(600),
            stage_timeout: Duration::from_secs(5),
            red_fix_max_attempts: 2,
            red_fix_timeout: Duration::from_secs(900),
            refactor: RefactorThresholds::default(),
        },
    );
    let worker = Worker::new(
        WorkerId::new(1),
        db.clone(),
        pipeline,
        collaborators.git,
        circuits.clone(),
        worker_settings,
    );
    worker.db.workers().register(worker.id()).await.unwrap();
    Fixture {
        db,
        project,
        circuits,
        worker,
    }
}

impl Fixture {
    async fn task(&self, key: &str, script: TaskScript) -> Task {
        self.project.script(key, script).await;
        let ids = seed(&self.db, &[NewTask::new(key, 1, format!("tests/test_{key}.py"), format!("src/{key}.py"))]).await;
        self.db.tasks().get(ids[0]).await.unwrap().unwrap()
    }

    async fn status(&self, task: &Task) -> TaskStatus {
        self.db.tasks().get(task.id).await.unwrap().unwrap().status
    }

    async fn release_outcome(&self, task: &Task) -> Option<ReleaseOutcome> {
        self.db
            .audit()
            .claim_history(task.id)
            .await
            .unwrap()
            .last()
            .and_then(|claim| claim.outcome)
    }
}

mod per_task_branches {
    use super::*;

    mod when_the_pipeline_completes {
        use super::*;

        #[tokio::test]
        async fn then_the_branch_is_pushed_and_queued_for_merge() {
            // Given
            let f = fixture(settings(BranchMode::PerTask, false), 100).await;
            let task = f.task("OK-01", TaskScript::happy()).await;

            // When
            let report = f.worker.process_task(&task).await;

            // Then
            assert!(report.is_success());
            assert_eq!(report.merge_branch.as_deref(), Some("swarm/OK-01"));
            assert_eq!(f.status(&task).await, TaskStatus::Complete);
            assert_eq!(f.release_outcome(&task).await, Some(ReleaseOutcome::Completed));
            assert_eq!(f.project.pushed().await, vec!["swarm/OK-01".to_string()]);

            let record = f.db.workers().get(WorkerId::new(1)).await.unwrap().unwrap();
            assert_eq!(record.status, WorkerStatus::Idle);
            assert_eq!(record.current_task_id, None);
        }
    }

    mod when_the_pipeline_fails {
        use super::*;

        #[tokio::test]
        async fn then_the_task_is_blocked_and_the_branch_rolled_back() {
            let f = fixture(settings(BranchMode::PerTask, false), 100).await;
            let task = f.task("BAD-01", TaskScript::happy().green_never_passes()).await;

            let report = f.worker.process_task(&task).await;

            assert!(report.is_failure());
            assert_eq!(report.merge_branch, None);
            assert_eq!(f.status(&task).await, TaskStatus::Blocked);
            assert_eq!(f.release_outcome(&task).await, Some(ReleaseOutcome::Failed));
            assert_eq!(f.project.rolled_back().await, vec!["swarm/BAD-01".to_string()]);
            let worker_circuit = f
                .db
                .circuits()
                .get(CircuitLevel::Worker, "worker-1", CircuitConfig::new(3, 1, 60))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(worker_circuit.failure_count, 1);
        }
    }

    mod when_static_review_never_clears {
        use super::*;
        use crate::types::{ReviewResult, Severity, Violation};

        #[tokio::test]
        async fn then_the_task_lands_in_blocked_static_review() {
            let f = fixture(settings(BranchMode::PerTask, false), 100).await;
            let blocking = |p: &str| ReviewResult::from_violations(vec![Violation::new(p, 1, Severity::Error)]);
            let task = f
                .task(
                    "REV-01",
                    TaskScript::happy().with_reviews([blocking("a"), blocking("b"), blocking("c")]),
                )
                .await;

            let report = f.worker.process_task(&task).await;

            assert!(report.is_failure());
            assert_eq!(f.status(&task).await, TaskStatus::BlockedStaticReview);
        }
    }
}

mod single_branch {
    use super::*;

    mod when_the_pipeline_completes {
        use super::*;

        #[tokio::test]
        async fn then_stage_commits_are_squashed_and_nothing_is_merged() {
            let f = fixture(settings(BranchMode::SingleBranch, false), 100).await;
            let task = f.task("SB-01", TaskScript::happy()).await;

            let report = f.worker.process_task(&task).await;

            assert!(report.is_success());
            assert_eq!(report.merge_branch, None);
            assert_eq!(f.project.squashed().await, vec!["SB-01".to_string()]);
            assert!(f.project.pushed().await.is_empty());
        }
    }

    mod when_the_pipeline_fails_with_restore_enabled {
        use super::*;

        #[tokio::test]
        async fn then_the_branch_is_reset_to_the_pre_task_commit() {
            let f = fixture(settings(BranchMode::SingleBranch, true), 100).await;
            let task = f.task("SB-02", TaskScript::happy().red_fails()).await;

            f.worker.process_task(&task).await;

            assert_eq!(f.project.restored().await, vec!["before-SB-02".to_string()]);
        }
    }

    mod when_the_pipeline_fails_without_restore {
        use super::*;

        #[tokio::test]
        async fn then_the_working_state_is_preserved() {
            let f = fixture(settings(BranchMode::SingleBranch, false), 100).await;
            let task = f.task("SB-03", TaskScript::happy().red_fails()).await;

            f.worker.process_task(&task).await;

            assert!(f.project.restored().await.is_empty());
            assert!(f.project.rolled_back().await.is_empty());
        }
    }
}

mod faults {
    use super::*;

    mod when_a_stage_panics {
        use super::*;

        #[tokio::test]
        async fn then_the_panic_is_contained_and_the_task_blocked() {
            let f = fixture(settings(BranchMode::PerTask, false), 100).await;
            let task = f.task("PANIC-01", TaskScript::happy().panics_in(Stage::Green)).await;

            let report = f.worker.process_task(&task).await;

            match &report.disposition {
                TaskDisposition::Crashed { message } => assert!(message.contains("scripted panic")),
                other => panic!("expected a crash report, got {other:?}"),
            }
            assert_eq!(f.status(&task).await, TaskStatus::Blocked);
            assert_eq!(f.release_outcome(&task).await, Some(ReleaseOutcome::Failed));
            let held = f.db.tasks().get(task.id).await.unwrap().unwrap();
            assert_eq!(held.claimed_by, None);
            assert!(f.circuits.status().await.unwrap().iter().any(|c| c.level == CircuitLevel::Worker));
        }
    }

    mod when_another_worker_holds_the_claim {
        use super::*;

        #[tokio::test]
        async fn then_the_task_is_skipped_without_a_failure() {
            let f = fixture(settings(BranchMode::PerTask, false), 100).await;
            let task = f.task("TAKEN-01", TaskScript::happy()).await;
            assert!(f
                .db
                .tasks()
                .claim(task.id, WorkerId::new(7), Duration::from_secs(600))
                .await
                .unwrap());

            let report = f.worker.process_task(&task).await;

            assert_eq!(report.disposition, TaskDisposition::ClaimLost);
            assert!(!report.is_failure());
            assert!(f.project.calls().await.is_empty());
        }
    }

    mod when_the_budget_runs_out_mid_task {
        use super::*;

        #[tokio::test]
        async fn then_the_task_returns_to_pending() {
            let f = fixture(settings(BranchMode::PerTask, false), 1).await;
            let task = f.task("BUDGET-01", TaskScript::happy()).await;

            let report = f.worker.process_task(&task).await;

            assert!(report.exhausted_budget());
            assert!(!report.is_failure());
            assert_eq!(
                report.disposition,
                TaskDisposition::Finished {
                    outcome: PipelineOutcome::BudgetExhausted { stage: Stage::Green }
                }
            );
            assert_eq!(f.status(&task).await, TaskStatus::Pending);
            assert_eq!(f.release_outcome(&task).await, Some(ReleaseOutcome::Released));
        }
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_leaves_no_worker_row() {
        let f = fixture(settings(BranchMode::PerTask, false), 100).await;

        let heartbeat = f.worker.start().await.unwrap();
        assert!(f.db.workers().get(WorkerId::new(1)).await.unwrap().is_some());
        f.worker.stop(heartbeat).await.unwrap();

        assert!(f.db.workers().get(WorkerId::new(1)).await.unwrap().is_none());
    }
}
