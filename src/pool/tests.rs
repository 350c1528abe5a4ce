// Scheduler behaviour against the in-memory project: stop reasons, merges,
// gates and what ends up recorded on the run.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use super::WorkerPool;
use crate::adapters::{ScriptedProject, TaskScript};
use crate::config::SwarmConfig;
use crate::db::test_support::{memory_db, seed};
use crate::db::SwarmDb;
use crate::types::{CircuitLevel, NewTask, RunStatus, StopReason, TaskKey, TaskStatus, WorkerId};
use chrono::Duration as ChronoDuration;
use std::time::Duration;

fn config(max_workers: u32, ceiling: u64) -> SwarmConfig {
    SwarmConfig {
        max_workers,
        max_invocations_per_session: ceiling,
        green_retry_delay_ms: 0,
        ..SwarmConfig::default()
    }
}

fn task(key: &str, phase: i64) -> NewTask {
    NewTask::new(key, phase, format!("tests/test_{key}.py"), format!("src/{key}.py"))
}

async fn status(db: &SwarmDb, key: &str) -> TaskStatus {
    db.tasks()
        .get_by_key(&TaskKey::new(key))
        .await
        .unwrap()
        .unwrap()
        .status
}

mod when_the_budget_runs_out {
    use super::*;

    #[tokio::test]
    async fn then_the_run_stops_with_invocation_limit_and_the_task_stays_pending() {
        // Given: each clean task costs RED + GREEN
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 1)]).await;
        let project = ScriptedProject::new();
        let pool = WorkerPool::new(db.clone(), config(1, 3), project.collaborators());

        // When
        let result = pool.run_parallel_phase(1).await.unwrap();

        // Then
        assert_eq!(result.stopped_reason, Some(StopReason::InvocationLimit));
        assert_eq!(result.tasks_completed, 1);
        assert_eq!(result.tasks_failed, 0);
        assert_eq!(result.invocations.used, 3);
        assert_eq!(status(&db, "A").await, TaskStatus::Complete);
        assert_eq!(status(&db, "B").await, TaskStatus::Pending);

        let run = db.runs().latest().await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.total_invocations, 3);
        assert_eq!(run.stopped_reason, Some(StopReason::InvocationLimit));
    }
}

mod when_a_later_phase_is_still_running {
    use super::*;

    #[tokio::test]
    async fn then_invocations_from_finished_batches_are_already_on_the_run() {
        // Given: phase 2 stalls inside its first stage call
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("FAST", 1), task("STALLED", 2)]).await;
        let project = ScriptedProject::new();
        project
            .script("STALLED", TaskScript::happy().slow(Duration::from_millis(400)))
            .await;
        let pool = WorkerPool::new(db.clone(), config(1, 100), project.collaborators());

        // When
        let handle = tokio::spawn(async move { pool.run_all_phases().await });
        let mut seen_mid_run = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(run) = db.runs().latest().await.unwrap() {
                if run.status == RunStatus::Running && run.total_invocations > 0 {
                    seen_mid_run = Some(run.total_invocations);
                    break;
                }
            }
        }
        let result = handle.await.unwrap().unwrap();

        // Then
        assert_eq!(seen_mid_run, Some(2), "phase 1 cost RED + GREEN");
        assert_eq!(result.tasks_completed, 2);
        let run = db.runs().latest().await.unwrap().unwrap();
        assert_eq!(run.total_invocations, 4);
    }
}

mod when_an_earlier_session_left_an_expired_claim {
    use super::*;

    #[tokio::test]
    async fn then_the_task_is_reset_and_run_in_this_phase() {
        // Given: a crashed session's worker still holds T1 with a lapsed lease
        let (db, clock) = memory_db().await;
        let ids = seed(&db, &[task("T1", 1)]).await;
        assert!(db
            .tasks()
            .claim(ids[0], WorkerId::new(1), Duration::from_secs(60))
            .await
            .unwrap());
        clock.advance(ChronoDuration::seconds(600));
        let project = ScriptedProject::new();
        let pool = WorkerPool::new(db.clone(), config(1, 100), project.collaborators());

        // When
        let result = pool.run_parallel_phase(1).await.unwrap();

        // Then
        assert_eq!(result.tasks_completed, 1);
        assert_eq!(result.phases[0].stale_claims_reset, 1);
        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(status(&db, "T1").await, TaskStatus::Complete);
        let reports = &result.phases[0].reports;
        assert_eq!(reports.len(), 1);
        assert_ne!(reports[0].worker_id, WorkerId::new(1));
    }
}

mod when_a_branch_conflicts_on_merge {
    use super::*;

    #[tokio::test]
    async fn then_earlier_branches_stay_merged_and_a_human_is_notified() {
        // Given
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 1)]).await;
        let project = ScriptedProject::new();
        project
            .script("B", TaskScript::happy().conflicts_on(["src/shared.py"]))
            .await;
        let pool = WorkerPool::new(db.clone(), config(1, 100), project.collaborators());

        // When
        let result = pool.run_parallel_phase(1).await.unwrap();

        // Then
        assert_eq!(result.stopped_reason, Some(StopReason::MergeConflict));
        assert_eq!(result.tasks_completed, 2);
        assert_eq!(result.phases[0].merged, vec!["swarm/A".to_string()]);
        assert_eq!(project.merged().await, vec!["swarm/A".to_string()]);
        let notifications = project.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].1.contains("src/shared.py"));
        assert_eq!(result.exit_code(), 1);
    }
}

mod when_an_earlier_phase_regresses {
    use super::*;

    #[tokio::test]
    async fn then_the_gate_stops_the_run_before_the_next_phase() {
        // Given
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 2).depending_on(["A"])]).await;
        let project = ScriptedProject::new();
        project.script("A", TaskScript::happy().fails_regression()).await;
        let pool = WorkerPool::new(db.clone(), config(2, 100), project.collaborators());

        // When
        let result = pool.run_all_phases().await.unwrap();

        // Then
        assert_eq!(result.stopped_reason, Some(StopReason::PhaseGateFailed));
        let gate = result.failed_gate.as_ref().unwrap();
        assert_eq!(gate.phase, 2);
        assert_eq!(gate.regression_failures[0].test_file, "tests/test_A.py");
        assert!(project.calls_for("B").await.is_empty());
        assert_eq!(status(&db, "B").await, TaskStatus::Pending);
        assert!(result.validation.is_none());
    }
}

mod when_gates_are_disabled {
    use super::*;

    #[tokio::test]
    async fn then_the_regression_does_not_stop_the_next_phase() {
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 2).depending_on(["A"])]).await;
        let project = ScriptedProject::new();
        project.script("A", TaskScript::happy().fails_regression()).await;
        let pool = WorkerPool::new(
            db.clone(),
            SwarmConfig {
                enable_phase_gates: false,
                ..config(2, 100)
            },
            project.collaborators(),
        );

        let result = pool.run_all_phases().await.unwrap();

        assert_eq!(result.stopped_reason, None);
        assert_eq!(result.tasks_completed, 2);
        // end-of-run validation still catches it
        let validation = result.validation.as_ref().unwrap();
        assert!(!validation.passed);
        assert_eq!(result.exit_code(), 1);
        let run = db.runs().latest().await.unwrap().unwrap();
        assert_eq!(run.validation_passed, Some(false));
    }
}

mod phase_health {
    use super::*;

    #[tokio::test]
    async fn each_phase_records_its_outcome_on_a_system_circuit() {
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 2)]).await;
        let project = ScriptedProject::new();
        project.script("B", TaskScript::happy().red_fails()).await;
        let pool = WorkerPool::new(db.clone(), config(1, 100), project.collaborators());

        let result = pool.run_all_phases().await.unwrap();

        assert_eq!(result.stopped_reason, Some(StopReason::TaskFailure));
        let circuits = pool.circuits().status().await.unwrap();
        let system = |id: &str| {
            circuits
                .iter()
                .find(|c| c.level == CircuitLevel::System && c.identifier == id)
                .cloned()
                .unwrap()
        };
        assert_eq!(system("phase-1").failure_count, 0);
        assert_eq!(system("phase-2").failure_count, 1);
    }

    #[tokio::test]
    async fn workers_are_unregistered_once_the_phase_ends() {
        let (db, _clock) = memory_db().await;
        seed(&db, &[task("A", 1), task("B", 1), task("C", 1)]).await;
        let pool = WorkerPool::new(db.clone(), config(3, 100), ScriptedProject::new().collaborators());

        let result = pool.run_parallel_phase(1).await.unwrap();

        assert!(result.is_success());
        assert!(db.workers().list().await.unwrap().is_empty());
    }
}
