//! One execution slot of the pool: claim, run the pipeline, settle the
//! branch, release.

mod heartbeat;
#[cfg(test)]
mod tests;

pub use heartbeat::Heartbeat;

use crate::config::SwarmConfig;
use crate::db::SwarmDb;
use crate::error::Result;
use crate::pipeline::{PipelineOutcome, PipelineRunner};
use crate::ports::{BranchMode, GitOps, Workspace};
use crate::retry::CircuitRegistry;
use crate::types::{CircuitLevel, ReleaseOutcome, Task, TaskId, TaskKey, TaskStatus, WorkerId};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub claim_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub branch_mode: BranchMode,
    pub restore_on_failure: bool,
}

impl From<&SwarmConfig> for WorkerSettings {
    fn from(config: &SwarmConfig) -> Self {
        Self {
            claim_timeout: config.claim_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            branch_mode: if config.single_branch_mode {
                BranchMode::SingleBranch
            } else {
                BranchMode::PerTask
            },
            restore_on_failure: config.restore_on_failure,
        }
    }
}

/// What happened to one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskDisposition {
    Finished { outcome: PipelineOutcome },
    /// The worker hit an error or panic; the task was marked blocked.
    Crashed { message: String },
    /// Another worker held the task first.
    ClaimLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub task_key: TaskKey,
    pub worker_id: WorkerId,
    pub disposition: TaskDisposition,
    /// Per-task branch waiting to be merged after the phase.
    pub merge_branch: Option<String>,
}

impl TaskReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            &self.disposition,
            TaskDisposition::Finished {
                outcome: PipelineOutcome::Complete { .. }
            }
        )
    }

    /// Counts against the 100%-success gate. Losing a claim race does not.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        match &self.disposition {
            TaskDisposition::Finished { outcome } => {
                !matches!(
                    outcome,
                    PipelineOutcome::Complete { .. } | PipelineOutcome::BudgetExhausted { .. }
                )
            }
            TaskDisposition::Crashed { .. } => true,
            TaskDisposition::ClaimLost => false,
        }
    }

    #[must_use]
    pub const fn exhausted_budget(&self) -> bool {
        matches!(
            &self.disposition,
            TaskDisposition::Finished {
                outcome: PipelineOutcome::BudgetExhausted { .. }
            }
        )
    }
}

pub struct Worker {
    id: WorkerId,
    db: SwarmDb,
    pipeline: PipelineRunner,
    git: Arc<dyn GitOps>,
    circuits: CircuitRegistry,
    settings: WorkerSettings,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: WorkerId,
        db: SwarmDb,
        pipeline: PipelineRunner,
        git: Arc<dyn GitOps>,
        circuits: CircuitRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            db,
            pipeline,
            git,
            circuits,
            settings,
        }
    }

    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Registers the worker and starts its heartbeat loop.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub async fn start(&self) -> Result<Heartbeat> {
        self.db.workers().register(self.id).await?;
        info!(worker_id = %self.id, "Worker registered");
        Ok(Heartbeat::spawn(
            self.db.clone(),
            self.id,
            self.settings.heartbeat_interval,
            self.settings.claim_timeout,
        ))
    }

    /// Stops the heartbeat loop, waiting for it, then unregisters.
    ///
    /// # Errors
    /// Returns an error if unregistering fails.
    pub async fn stop(&self, heartbeat: Heartbeat) -> Result<()> {
        let beats = heartbeat.stop().await;
        self.db.workers().unregister(self.id).await?;
        info!(worker_id = %self.id, beats, "Worker unregistered");
        Ok(())
    }

    /// Claims and runs one task end to end. Never fails: store errors, git
    /// errors and panics are turned into a `Crashed` report and the task is
    /// marked blocked.
    pub async fn process_task(&self, task: &Task) -> TaskReport {
        let report = |disposition, merge_branch| TaskReport {
            task_id: task.id,
            task_key: task.task_key.clone(),
            worker_id: self.id,
            disposition,
            merge_branch,
        };

        match self
            .db
            .tasks()
            .claim(task.id, self.id, self.settings.claim_timeout)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id = %self.id, task_key = %task.task_key, "Claim lost to another worker");
                return report(TaskDisposition::ClaimLost, None);
            }
            Err(e) => {
                warn!(worker_id = %self.id, task_key = %task.task_key, error = %e, "Claim failed");
                return report(TaskDisposition::Crashed { message: e.to_string() }, None);
            }
        }
        info!(worker_id = %self.id, task_key = %task.task_key, phase = task.phase, "Task claimed");

        let run = AssertUnwindSafe(self.execute(task)).catch_unwind().await;
        let result = match run {
            Ok(Ok((outcome, merge_branch))) => {
                self.record_worker_health(outcome.is_success()).await;
                report(TaskDisposition::Finished { outcome }, merge_branch)
            }
            Ok(Err(e)) => {
                error!(worker_id = %self.id, task_key = %task.task_key, error = %e, "Worker error");
                self.abandon(task).await;
                report(TaskDisposition::Crashed { message: e.to_string() }, None)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id = %self.id, task_key = %task.task_key, panic = %message, "Worker panicked");
                self.abandon(task).await;
                report(TaskDisposition::Crashed { message }, None)
            }
        };

        if let Err(e) = self.db.workers().set_idle(self.id).await {
            warn!(worker_id = %self.id, error = %e, "Could not mark worker idle");
        }
        result
    }

    async fn execute(&self, task: &Task) -> Result<(PipelineOutcome, Option<String>)> {
        let workspace = self
            .git
            .prepare_workspace(task, self.id, self.settings.branch_mode)
            .await?;
        let outcome = self.pipeline.run(task, &workspace, self.id).await?;
        info!(worker_id = %self.id, task_key = %task.task_key, outcome = %outcome.describe(), "Pipeline finished");

        let merge_branch = self.settle_workspace(task, &workspace, &outcome).await?;
        if let Some(status) = outcome.terminal_status() {
            self.db.tasks().mark_terminal(task.id, self.id, status).await?;
        }
        self.db
            .tasks()
            .release(task.id, self.id, outcome.release_outcome())
            .await?;
        Ok((outcome, merge_branch))
    }

    /// Pushes or squashes a finished task, rolls back or restores a failed one.
    async fn settle_workspace(
        &self,
        task: &Task,
        workspace: &Workspace,
        outcome: &PipelineOutcome,
    ) -> Result<Option<String>> {
        match (outcome.is_success(), workspace.isolated) {
            (true, true) => {
                self.git.push_branch(workspace).await?;
                Ok(Some(workspace.branch.clone()))
            }
            (true, false) => {
                self.git.squash_task(workspace, task).await?;
                Ok(None)
            }
            (false, true) => {
                self.git.rollback(workspace).await?;
                Ok(None)
            }
            (false, false) => {
                if self.settings.restore_on_failure {
                    self.git.restore(workspace, task).await?;
                }
                Ok(None)
            }
        }
    }

    /// Best-effort cleanup after an error or panic: block the task and let
    /// go of the claim.
    async fn abandon(&self, task: &Task) {
        self.record_worker_health(false).await;
        let blocked = self
            .db
            .tasks()
            .mark_terminal(task.id, self.id, TaskStatus::Blocked)
            .await;
        let released = self
            .db
            .tasks()
            .release(task.id, self.id, ReleaseOutcome::Failed)
            .await;
        if let Err(e) = blocked.and(released) {
            error!(worker_id = %self.id, task_key = %task.task_key, error = %e, "Could not release abandoned task");
        }
    }

    async fn record_worker_health(&self, success: bool) {
        let identifier = self.id.to_string();
        let recorded = if success {
            self.circuits.record_success(CircuitLevel::Worker, &identifier).await
        } else {
            self.circuits.record_failure(CircuitLevel::Worker, &identifier).await
        };
        if let Err(e) = recorded {
            warn!(worker_id = %self.id, error = %e, "Could not record worker breaker outcome");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
