// BDD-style tests for worker registration, heartbeats and stale reclamation.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use crate::db::test_support::{memory_db, seed};
use crate::types::{NewTask, ReleaseOutcome, TaskStatus, WorkerId, WorkerStatus};
use chrono::Duration as ChronoDuration;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(60);
const STALE_AFTER: Duration = Duration::from_secs(90);

mod heartbeats {
    use super::*;

    #[tokio::test]
    async fn heartbeat_extends_the_lease_of_held_tasks() {
        // Given
        let (db, clock) = memory_db().await;
        let worker = WorkerId::new(1);
        db.workers().register(worker).await.unwrap();
        let ids = seed(&db, &[NewTask::new("HB-01", 0, "t.py", "i.py")]).await;
        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());

        // When - beat at 50s, then look at 100s
        clock.advance(ChronoDuration::seconds(50));
        assert!(db.workers().heartbeat(worker, LEASE).await.unwrap());
        clock.advance(ChronoDuration::seconds(50));

        // Then
        assert_eq!(db.tasks().cleanup_stale_claims().await.unwrap(), 0);
        let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_worker_reports_false() {
        let (db, _clock) = memory_db().await;
        assert!(!db.workers().heartbeat(WorkerId::new(9), LEASE).await.unwrap());
    }
}

mod registration {
    use super::*;

    #[tokio::test]
    async fn claiming_makes_the_worker_active_on_that_task() {
        let (db, _clock) = memory_db().await;
        let worker = WorkerId::new(2);
        let ids = seed(&db, &[NewTask::new("REG-01", 0, "t.py", "i.py")]).await;

        db.workers().register(worker).await.unwrap();
        let record = db.workers().get(worker).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Idle);

        assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());
        let record = db.workers().get(worker).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Active);
        assert_eq!(record.current_task_id, Some(ids[0]));

        db.workers().set_idle(worker).await.unwrap();
        assert!(db.workers().unregister(worker).await.unwrap());
        assert!(db.workers().get(worker).await.unwrap().is_none());
    }
}

mod reused_ids {
    use super::*;

    mod when_an_earlier_session_left_a_claim_under_the_same_id {
        use super::*;

        #[tokio::test]
        async fn then_heartbeats_only_extend_the_task_being_worked_on() {
            // Given: worker 1 of a dead session still holds ORPHAN
            let (db, clock) = memory_db().await;
            let worker = WorkerId::new(1);
            let ids = seed(
                &db,
                &[
                    NewTask::new("ORPHAN", 0, "to.py", "o.py"),
                    NewTask::new("CURRENT", 0, "tc.py", "c.py"),
                ],
            )
            .await;
            assert!(db.tasks().claim(ids[0], worker, LEASE).await.unwrap());

            // When: a new worker 1 registers, claims CURRENT and keeps beating
            db.workers().register(worker).await.unwrap();
            assert!(db.tasks().claim(ids[1], worker, LEASE).await.unwrap());
            clock.advance(ChronoDuration::seconds(50));
            assert!(db.workers().heartbeat(worker, LEASE).await.unwrap());
            clock.advance(ChronoDuration::seconds(50));

            // Then
            assert_eq!(db.tasks().cleanup_stale_claims().await.unwrap(), 1);
            let orphan = db.tasks().get(ids[0]).await.unwrap().unwrap();
            assert_eq!(orphan.status, TaskStatus::Pending);
            assert!(orphan.claimed_by.is_none());
            let current = db.tasks().get(ids[1]).await.unwrap().unwrap();
            assert_eq!(current.status, TaskStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn reserved_ids_start_above_every_id_ever_seen() {
        // Given: worker 4 claimed and released, worker 7 is registered
        let (db, _clock) = memory_db().await;
        let ids = seed(&db, &[NewTask::new("R-01", 0, "t.py", "i.py")]).await;
        assert!(db.tasks().claim(ids[0], WorkerId::new(4), LEASE).await.unwrap());
        assert!(db
            .tasks()
            .release(ids[0], WorkerId::new(4), ReleaseOutcome::Released)
            .await
            .unwrap());
        db.workers().register(WorkerId::new(7)).await.unwrap();

        // When
        let first = db.workers().reserve(2).await.unwrap();
        let second = db.workers().reserve(1).await.unwrap();

        // Then
        assert_eq!(first, vec![WorkerId::new(8), WorkerId::new(9)]);
        assert_eq!(second, vec![WorkerId::new(10)]);
        let record = db.workers().get(WorkerId::new(9)).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Idle);
    }
}

mod stale_workers {
    use super::*;

    mod when_a_worker_goes_silent {
        use super::*;

        #[tokio::test]
        async fn then_it_is_marked_dead_and_its_tasks_return_to_pending() {
            // Given
            let (db, clock) = memory_db().await;
            let silent = WorkerId::new(1);
            let healthy = WorkerId::new(2);
            db.workers().register(silent).await.unwrap();
            db.workers().register(healthy).await.unwrap();
            let ids = seed(&db, &[NewTask::new("SW-01", 0, "t.py", "i.py")]).await;
            // A long lease so only the heartbeat gap can free the task.
            assert!(db
                .tasks()
                .claim(ids[0], silent, Duration::from_secs(3600))
                .await
                .unwrap());

            // When
            clock.advance(ChronoDuration::seconds(60));
            db.workers().heartbeat(healthy, LEASE).await.unwrap();
            clock.advance(ChronoDuration::seconds(40));

            let stale = db.workers().stale_workers(STALE_AFTER).await.unwrap();
            let report = db.workers().reclaim_stale_workers(STALE_AFTER).await.unwrap();

            // Then
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].worker_id, silent);
            assert_eq!(report.workers, vec![silent]);
            assert_eq!(report.tasks_reset, 1);

            let task = db.tasks().get(ids[0]).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert!(task.claimed_by.is_none());

            let record = db.workers().get(silent).await.unwrap().unwrap();
            assert_eq!(record.status, WorkerStatus::Dead);
            assert!(!db.workers().heartbeat(silent, LEASE).await.unwrap());
        }
    }

    #[tokio::test]
    async fn a_second_sweep_finds_nothing() {
        let (db, clock) = memory_db().await;
        db.workers().register(WorkerId::new(1)).await.unwrap();
        clock.advance(ChronoDuration::seconds(120));

        assert_eq!(
            db.workers()
                .reclaim_stale_workers(STALE_AFTER)
                .await
                .unwrap()
                .workers
                .len(),
            1
        );
        assert!(db
            .workers()
            .reclaim_stale_workers(STALE_AFTER)
            .await
            .unwrap()
            .workers
            .is_empty());
    }
}
