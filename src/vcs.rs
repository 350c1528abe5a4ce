use crate::ports::{BranchMode, GitOps, MergeOutcome, PortFuture, Workspace};
use crate::types::{Stage, Task, WorkerId};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wraps a `GitOps` so that every operation touching shared repository state
/// runs under one pool-wide lock. Commits inside an isolated per-task
/// worktree are the only calls that bypass it.
#[derive(Clone)]
pub struct GitGate {
    inner: Arc<dyn GitOps>,
    lock: Arc<Mutex<()>>,
}

impl GitGate {
    #[must_use]
    pub fn new(inner: Arc<dyn GitOps>) -> Self {
        Self {
            inner,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl GitOps for GitGate {
    fn prepare_workspace<'a>(
        &'a self,
        task: &'a Task,
        worker_id: WorkerId,
        mode: BranchMode,
    ) -> PortFuture<'a, Workspace> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.prepare_workspace(task, worker_id, mode).await
        })
    }

    fn commit_stage<'a>(&'a self, workspace: &'a Workspace, task: &'a Task, stage: Stage) -> PortFuture<'a, bool> {
        Box::pin(async move {
            if workspace.isolated {
                return self.inner.commit_stage(workspace, task, stage).await;
            }
            let _guard = self.lock.lock().await;
            self.inner.commit_stage(workspace, task, stage).await
        })
    }

    fn squash_task<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.squash_task(workspace, task).await
        })
    }

    fn push_branch<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.push_branch(workspace).await
        })
    }

    fn rollback<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.rollback(workspace).await
        })
    }

    fn restore<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.restore(workspace, task).await
        })
    }

    fn discard_changes<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            if workspace.isolated {
                return self.inner.discard_changes(workspace, task).await;
            }
            let _guard = self.lock.lock().await;
            self.inner.discard_changes(workspace, task).await
        })
    }

    fn merge_branch<'a>(&'a self, branch: &'a str) -> PortFuture<'a, MergeOutcome> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.inner.merge_branch(branch).await
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::GitGate;
    use crate::error::SwarmError;
    use crate::ports::{BranchMode, GitOps, MergeOutcome, PortFuture, Workspace};
    use crate::types::{Stage, Task, WorkerId};
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Counts how many merges overlap in time.
    #[derive(Default)]
    struct OverlapCounter {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl GitOps for OverlapCounter {
        fn prepare_workspace<'a>(&'a self, _: &'a Task, _: WorkerId, _: BranchMode) -> PortFuture<'a, Workspace> {
            Box::pin(async { Err(SwarmError::Internal("not used".to_string())) })
        }
        fn commit_stage<'a>(&'a self, _: &'a Workspace, _: &'a Task, _: Stage) -> PortFuture<'a, bool> {
            Box::pin(async { Ok(true) })
        }
        fn squash_task<'a>(&'a self, _: &'a Workspace, _: &'a Task) -> PortFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn push_branch<'a>(&'a self, _: &'a Workspace) -> PortFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn rollback<'a>(&'a self, _: &'a Workspace) -> PortFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn restore<'a>(&'a self, _: &'a Workspace, _: &'a Task) -> PortFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn discard_changes<'a>(&'a self, _: &'a Workspace, _: &'a Task) -> PortFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn merge_branch<'a>(&'a self, _: &'a str) -> PortFuture<'a, MergeOutcome> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(MergeOutcome::Merged)
            })
        }
    }

    #[tokio::test]
    async fn concurrent_merges_never_overlap() {
        let counter = Arc::new(OverlapCounter::default());
        let gate = GitGate::new(counter.clone());
        let branches: Vec<String> = (0..8).map(|i| format!("swarm/T-{i}")).collect();

        let results = join_all(branches.iter().map(|b| gate.merge_branch(b))).await;

        assert!(results.iter().all(|r| matches!(r, Ok(MergeOutcome::Merged))));
        assert_eq!(counter.max_seen.load(Ordering::SeqCst), 1);
    }
}
