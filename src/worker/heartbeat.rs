use crate::db::SwarmDb;
use crate::types::WorkerId;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background loop refreshing one worker's heartbeat and claim lease.
///
/// Must be stopped with [`Heartbeat::stop`], which waits for the loop to exit
/// so no heartbeat write can land after the worker unregisters.
pub struct Heartbeat {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<u64>,
}

impl Heartbeat {
    #[must_use]
    pub fn spawn(db: SwarmDb, worker_id: WorkerId, interval: Duration, lease: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut beats = 0_u64;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        match db.workers().heartbeat(worker_id, lease).await {
                            Ok(true) => beats += 1,
                            Ok(false) => {
                                warn!(%worker_id, "Heartbeat rejected; worker is unknown or dead");
                                break;
                            }
                            Err(e) => warn!(%worker_id, error = %e, "Heartbeat write failed"),
                        }
                    }
                }
            }
            debug!(%worker_id, beats, "Heartbeat loop stopped");
            beats
        });
        Self { stop, handle }
    }

    /// Signals the loop and waits for it. Returns the number of heartbeats
    /// written.
    pub async fn stop(self) -> u64 {
        let _ = self.stop.send(());
        self.handle.await.unwrap_or_else(|e| {
            warn!(error = %e, "Heartbeat loop ended abnormally");
            0
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::Heartbeat;
    use crate::db::test_support::{memory_db, seed};
    use crate::types::{NewTask, WorkerId};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[tokio::test]
    async fn heartbeats_refresh_the_worker_and_extend_its_claim() {
        // Given
        let (db, clock) = memory_db().await;
        let worker = WorkerId::new(1);
        db.workers().register(worker).await.unwrap();
        let ids = seed(&db, &[NewTask::new("HB-01", 1, "t.py", "i.py")]).await;
        assert!(db.tasks().claim(ids[0], worker, Duration::from_secs(60)).await.unwrap());
        let before = db.tasks().get(ids[0]).await.unwrap().unwrap().claim_expires_at;
        clock.advance(ChronoDuration::seconds(45));

        // When
        let heartbeat = Heartbeat::spawn(db.clone(), worker, Duration::from_millis(10), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let beats = heartbeat.stop().await;

        // Then
        assert!(beats >= 1);
        let after = db.tasks().get(ids[0]).await.unwrap().unwrap().claim_expires_at;
        assert!(after > before, "lease was extended");
        let record = db.workers().get(worker).await.unwrap().unwrap();
        assert_eq!(record.last_heartbeat, db.now());
    }

    #[tokio::test]
    async fn stop_waits_for_the_loop_to_finish() {
        let (db, _clock) = memory_db().await;
        let worker = WorkerId::new(2);
        db.workers().register(worker).await.unwrap();

        let heartbeat = Heartbeat::spawn(db.clone(), worker, Duration::from_secs(3600), Duration::from_secs(60));
        let beats = heartbeat.stop().await;

        // interval fires immediately, so at most the first tick landed
        assert!(beats <= 1);
        assert!(db.workers().unregister(worker).await.unwrap());
    }

    #[tokio::test]
    async fn a_dead_worker_stops_beating() {
        let (db, _clock) = memory_db().await;

        let heartbeat = Heartbeat::spawn(db, WorkerId::new(9), Duration::from_millis(10), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(heartbeat.stop().await, 0);
    }
}
