// BDD-style tests for task claiming: mutual exclusion, leases, dependency
// gating and the release audit trail.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use crate::db::test_support::{file_db, memory_db, seed};
use crate::types::{NewTask, ReleaseOutcome, TaskStatus, WorkerId};
use chrono::Duration as ChronoDuration;
use futures_util::future::join_all;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(60);

mod claiming {
    use super::*;

    mod when_many_workers_race_for_one_task {
        use super::*;

        #[tokio::test]
        async fn then_exactly_one_claim_succeeds() {
            // Given
            let (db, _clock, _dir) = file_db().await;
            let ids = seed(&db, &[NewTask::new("RACE-01", 0, "t.py", "i.py")]).await;
            let task_id = ids[0];

            // When
            let attempts = (1..=16).map(|n| {
                let db = db.clone();
                async move { db.tasks().claim(task_id, WorkerId::new(n), LEASE).await }
            });
            let results = join_all(attempts).await;

            // Then
            let winners = results
                .iter()
                .filter(|r| matches!(r, Ok(true)))
                .count();
            assert_eq!(winners, 1, "exactly one claimer wins");
            assert!(results.iter().all(Result::is_ok), "losing a race is not an error");

            let task = db.tasks().get(task_id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::InProgress);
            assert_eq!(task.version, 1);
            assert_eq!(db.audit().total_claims().await.unwrap(), 1);
        }
    }

    mod when_more_tasks_than_workers {
        use super::*;

        #[tokio::test]
        async fn then_every_task_has_at_most_one_holder() {
            // Given
            let (db, _clock, _dir) = file_db().await;
            let tasks: Vec<_> = (1..=6)
                .map(|n| NewTask::new(format!("MANY-{n:02}"), 0, "t.py", "i.py"))
                .collect();
            let ids = seed(&db, &tasks).await;

            // When - every worker tries every task
            let attempts = (1..=4_u32).flat_map(|worker| {
                ids.iter().map(move |task_id| (worker, *task_id))
            });
            let futures = attempts.map(|(worker, task_id)| {
                let db = db.clone();
                async move {
                    db.tasks()
                        .claim(task_id, WorkerId::new(worker), LEASE)
                        .await
                        .map(|won| won.then_some(task_id))
                }
            });
            let won: Vec<_> = join_all(futures)
                .await
                .into_iter()
                .filter_map(|r| r.ok().flatten())
                .collect();

            // Then
            assert_eq!(won.len(), ids.len());
            let unique: std::collections::HashSet<_> = won.iter().collect();
            assert_eq!(unique.len(), ids.len(), "no task is claimed twice");
        }
    }

    mod when_a_task_is_not_pending {
        use super::*;

        #[tokio::test]
        async fn then_the_claim_is_refused_without_error() {
            let (db, _clock) = memory_db().await;
            let ids = seed(&db, &[NewTask::new("DONE-01", 0, "t.py", "i.py")]).await;
            let worker = WorkerId::new(1);

            assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());
            assert!(db
                .tasks()
                .mark_terminal(ids[0], worker, TaskStatus::Complete)
                .await
                .unwrap());
            db.tasks()
                .release(ids[0], worker, ReleaseOutcome::Completed)
                .await
                .unwrap();

            assert!(!db.tasks().claim(ids[0], WorkerId::new(2), LEASE).await.unwrap());
        }
    }
}

mod stale_claims {
    use super::*;

    mod when_a_lease_expires {
        use super::*;

        #[tokio::test]
        async fn then_cleanup_returns_the_task_to_pending_and_it_is_reclaimable() {
            // Given
            let (db, clock) = memory_db().await;
            let ids = seed(&db, &[NewTask::new("STALE-01", 0, "t.py", "i.py")]).await;
            assert!(db.tasks().claim(ids[0], WorkerId::new(1), LEASE).await.unwrap());

            // When
            clock.advance(ChronoDuration::seconds(61));
            let reset = db.tasks().cleanup_stale_claims().await.unwrap();

            // Then
            assert_eq!(reset, 1);
            let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert!(task.claimed_by.is_none());
            assert!(db.tasks().claim(ids[0], WorkerId::new(2), LEASE).await.unwrap());

            let history = db.audit().claim_history(ids[0]).await.unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].outcome, Some(ReleaseOutcome::Timeout));
            assert_eq!(history[1].worker_id, WorkerId::new(2));
        }
    }

    mod when_the_lease_is_still_live {
        use super::*;

        #[tokio::test]
        async fn then_cleanup_leaves_the_claim_alone() {
            let (db, clock) = memory_db().await;
            let ids = seed(&db, &[NewTask::new("LIVE-01", 0, "t.py", "i.py")]).await;
            assert!(db.tasks().claim(ids[0], WorkerId::new(1), LEASE).await.unwrap());

            clock.advance(ChronoDuration::seconds(30));

            assert_eq!(db.tasks().cleanup_stale_claims().await.unwrap(), 0);
            let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
            assert!(task.has_live_claim(clock_now(&db)));
        }
    }

    fn clock_now(db: &crate::db::SwarmDb) -> chrono::DateTime<chrono::Utc> {
        db.now()
    }
}

mod dependency_gating {
    use super::*;

    #[tokio::test]
    async fn dependents_become_claimable_only_after_complete_or_passing() {
        // Given
        let (db, _clock) = memory_db().await;
        let ids = seed(
            &db,
            &[
                NewTask::new("DEP-A", 0, "ta.py", "a.py"),
                NewTask::new("DEP-B", 0, "tb.py", "b.py").depending_on(["DEP-A"]),
                NewTask::new("DEP-C", 0, "tc.py", "c.py"),
            ],
        )
        .await;

        // When / Then - B is gated on A
        let keys: Vec<_> = db
            .tasks()
            .get_claimable_tasks(Some(0))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_key.value().to_string())
            .collect();
        assert_eq!(keys, vec!["DEP-A", "DEP-C"]);

        let worker = WorkerId::new(1);
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());
        assert!(db
            .tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Passing)
            .await
            .unwrap());
        db.tasks()
            .release(ids[0], worker, ReleaseOutcome::Completed)
            .await
            .unwrap();

        let claimable = db.tasks().get_claimable_tasks(Some(0)).await.unwrap();
        assert!(claimable.iter().any(|t| t.task_key.value() == "DEP-B"));
    }

    #[tokio::test]
    async fn blocked_dependency_keeps_dependents_gated() {
        let (db, _clock) = memory_db().await;
        let ids = seed(
            &db,
            &[
                NewTask::new("BLK-A", 0, "ta.py", "a.py"),
                NewTask::new("BLK-B", 0, "tb.py", "b.py").depending_on(["BLK-A"]),
            ],
        )
        .await;
        let worker = WorkerId::new(1);
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());
        db.tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Blocked)
            .await
            .unwrap();
        db.tasks()
            .release(ids[0], worker, ReleaseOutcome::Failed)
            .await
            .unwrap();

        assert!(db.tasks().get_claimable_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dangling_dependencies_are_reported_and_never_satisfied() {
        let (db, _clock) = memory_db().await;
        seed(
            &db,
            &[NewTask::new("ORPH-A", 0, "ta.py", "a.py").depending_on(["GHOST-01"])],
        )
        .await;

        let dangling = db.tasks().validate_dependencies().await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].missing.value(), "GHOST-01");
        assert!(db.tasks().get_claimable_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimable_tasks_respect_the_phase_filter() {
        let (db, _clock) = memory_db().await;
        seed(
            &db,
            &[
                NewTask::new("PH0-A", 0, "ta.py", "a.py"),
                NewTask::new("PH1-A", 1, "tb.py", "b.py"),
            ],
        )
        .await;

        let phase_one = db.tasks().get_claimable_tasks(Some(1)).await.unwrap();
        assert_eq!(phase_one.len(), 1);
        assert_eq!(phase_one[0].task_key.value(), "PH1-A");
        assert_eq!(db.tasks().phases().await.unwrap(), vec![0, 1]);
    }
}

mod releasing {
    use super::*;

    #[tokio::test]
    async fn second_release_is_a_no_op_without_audit_row() {
        // Given
        let (db, _clock) = memory_db().await;
        let ids = seed(&db, &[NewTask::new("REL-01", 0, "t.py", "i.py")]).await;
        let worker = WorkerId::new(3);
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());
        db.tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Complete)
            .await
            .unwrap();

        // When
        let first = db
            .tasks()
            .release(ids[0], worker, ReleaseOutcome::Completed)
            .await
            .unwrap();
        let second = db
            .tasks()
            .release(ids[0], worker, ReleaseOutcome::Completed)
            .await
            .unwrap();

        // Then
        assert!(first);
        assert!(!second);
        let history = db.audit().claim_history(ids[0]).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, Some(ReleaseOutcome::Completed));
        assert!(history[0].released_at.is_some());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_refused() {
        let (db, _clock) = memory_db().await;
        let ids = seed(&db, &[NewTask::new("REL-02", 0, "t.py", "i.py")]).await;
        assert!(db.tasks().claim(ids[0], WorkerId::new(1), LEASE).await.unwrap());

        let released = db
            .tasks()
            .release(ids[0], WorkerId::new(2), ReleaseOutcome::Failed)
            .await
            .unwrap();

        assert!(!released);
        let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
        assert_eq!(task.claimed_by, Some(WorkerId::new(1)));
    }

    #[tokio::test]
    async fn released_outcome_returns_unfinished_task_to_pending() {
        let (db, _clock) = memory_db().await;
        let ids = seed(&db, &[NewTask::new("REL-03", 0, "t.py", "i.py")]).await;
        let worker = WorkerId::new(1);
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());

        db.tasks()
            .release(ids[0], worker, ReleaseOutcome::Released)
            .await
            .unwrap();

        let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_status_is_reached_only_once() {
        let (db, _clock) = memory_db().await;
        let ids = seed(&db, &[NewTask::new("TERM-01", 0, "t.py", "i.py")]).await;
        let worker = WorkerId::new(1);
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());

        assert!(db
            .tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Complete)
            .await
            .unwrap());
        assert!(!db
            .tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Blocked)
            .await
            .unwrap());
        assert!(db
            .tasks()
            .mark_terminal(ids[0], worker, TaskStatus::Pending)
            .await
            .is_err());

        let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
    }
}
