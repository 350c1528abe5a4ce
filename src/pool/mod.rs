//! Wave-based scheduler: fans claimable tasks out to a fixed set of workers,
//! stops the run on the first failed task, and merges finished branches
//! sequentially after each phase.

mod budget;
mod merge;
mod results;
#[cfg(test)]
mod tests;

pub use budget::{BudgetUsage, InvocationBudget};
pub use merge::{MergeConflict, MergeCoordinator, MergeReport};
pub use results::{PhaseResult, RunResult, WorkerStats};

use crate::config::SwarmConfig;
use crate::db::SwarmDb;
use crate::error::{Result, SwarmError};
use crate::pipeline::{PipelineRunner, PipelineSettings};
use crate::ports::{Collaborators, GitOps};
use crate::retry::{CircuitRegistry, StaticReviewCircuitBreaker};
use crate::types::{CircuitLevel, RunId, RunStatus, StopReason, Task, WorkerId};
use crate::validation::{PhaseGateValidator, RunValidator};
use crate::vcs::GitGate;
use crate::worker::{TaskReport, Worker, WorkerSettings};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type JobQueue = Arc<Mutex<mpsc::Receiver<Task>>>;

pub struct WorkerPool {
    db: SwarmDb,
    config: SwarmConfig,
    collaborators: Collaborators,
    circuits: CircuitRegistry,
    review_breaker: Arc<StaticReviewCircuitBreaker>,
    budget: Arc<InvocationBudget>,
}

impl WorkerPool {
    /// Every git call the workers make goes through one [`GitGate`].
    #[must_use]
    pub fn new(db: SwarmDb, config: SwarmConfig, collaborators: Collaborators) -> Self {
        let git: Arc<dyn GitOps> = Arc::new(GitGate::new(collaborators.git.clone()));
        let collaborators = Collaborators { git, ..collaborators };
        let circuits = CircuitRegistry::new(db.clone(), config.circuit.into());
        let review_breaker = Arc::new(StaticReviewCircuitBreaker::new(
            config.review_breaker_threshold,
            config.review_breaker_cooldown(),
            db.clock(),
        ));
        let budget = Arc::new(InvocationBudget::new(
            config.max_invocations_per_session,
            config.budget_warning_threshold,
        ));
        Self {
            db,
            config,
            collaborators,
            circuits,
            review_breaker,
            budget,
        }
    }

    #[must_use]
    pub fn budget(&self) -> BudgetUsage {
        self.budget.usage()
    }

    #[must_use]
    pub const fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Runs a single phase as its own run. End-of-run validation is left to
    /// `run_all_phases`.
    ///
    /// # Errors
    /// Returns an error if the store or git fails outside a worker.
    pub async fn run_parallel_phase(&self, phase: i64) -> Result<RunResult> {
        self.run(&[phase], false).await
    }

    /// Runs every phase in order, then validates the integrated result.
    ///
    /// # Errors
    /// Returns an error if the store or git fails outside a worker.
    pub async fn run_all_phases(&self) -> Result<RunResult> {
        let phases = self.db.tasks().phases().await?;
        self.run(&phases, true).await
    }

    async fn run(&self, phases: &[i64], validate: bool) -> Result<RunResult> {
        let run = self.db.runs().start(self.config.max_workers).await?;
        info!(
            run_id = %run.id,
            phases = ?phases,
            workers = self.config.max_workers,
            ceiling = self.config.max_invocations_per_session,
            "Run started"
        );

        let mut result = RunResult::new(run.id, self.budget.usage());
        let driven = self.drive(run.id, phases, validate, &mut result).await;
        result.invocations = self.budget.usage();

        let status = if driven.is_ok() && result.is_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.db.runs().set_invocations(run.id, result.invocations.used).await?;
        self.db.runs().finish(run.id, status, result.stopped_reason).await?;

        match driven {
            Ok(()) => {
                info!(summary = %result.summary(), "Run finished");
                Ok(result)
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Run aborted");
                Err(e)
            }
        }
    }

    async fn drive(&self, run_id: RunId, phases: &[i64], validate: bool, result: &mut RunResult) -> Result<()> {
        let gate = PhaseGateValidator::new(self.db.clone(), self.collaborators.regression.clone());

        for &phase in phases {
            if self.config.enable_phase_gates {
                let verdict = gate.validate_phase(phase).await?;
                if !verdict.passed {
                    result.stop(StopReason::PhaseGateFailed);
                    result.failed_gate = Some(verdict);
                    return Ok(());
                }
            }

            let phase_result = self.run_phase(run_id, phase).await?;
            result.absorb(phase_result);
            if result.stopped_reason.is_some() {
                return Ok(());
            }
        }

        if validate {
            let validator = RunValidator::new(
                self.db.clone(),
                self.collaborators.regression.clone(),
                self.collaborators.checker.clone(),
            );
            let validation = validator.validate_run().await?;
            self.db
                .runs()
                .record_validation(run_id, validation.passed, &validation.summary())
                .await?;
            result.validation = Some(validation);
        }
        Ok(())
    }

    async fn run_phase(&self, run_id: RunId, phase: i64) -> Result<PhaseResult> {
        let started = Instant::now();
        info!(phase, "Phase started");

        let max_workers = usize::try_from(self.config.max_workers).unwrap_or(1).max(1);
        let (job_tx, job_rx) = mpsc::channel::<Task>(max_workers);
        let (report_tx, mut report_rx) = mpsc::channel::<TaskReport>(max_workers);
        let jobs: JobQueue = Arc::new(Mutex::new(job_rx));
        let ids = self.db.workers().reserve(self.config.max_workers.max(1)).await?;
        debug!(phase, workers = ?ids, "Worker ids reserved");
        let handles: Vec<JoinHandle<()>> = ids
            .into_iter()
            .map(|id| tokio::spawn(worker_loop(self.worker(id), jobs.clone(), report_tx.clone())))
            .collect();
        drop(report_tx);

        let mut phase_result = PhaseResult::new(phase);
        let dispatched = self
            .dispatch(run_id, phase, max_workers, &job_tx, &mut report_rx, &mut phase_result)
            .await;

        drop(job_tx);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(phase, error = %e, "Worker task aborted");
            }
        }
        dispatched?;

        self.sweep(&mut phase_result).await?;
        self.merge(&mut phase_result).await?;
        self.record_phase_health(&phase_result).await;

        info!(
            phase,
            completed = phase_result.tasks_completed(),
            failed = phase_result.tasks_failed(),
            merged = phase_result.merged.len(),
            stopped = ?phase_result.stopped_reason,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Phase finished"
        );
        Ok(phase_result)
    }

    /// Batch loop: expired claims are returned to `pending`, then claimable
    /// tasks go out up to `max_workers` at a time and every report of a batch
    /// is collected before the next one starts. The run's invocation count is
    /// persisted after every batch.
    async fn dispatch(
        &self,
        run_id: RunId,
        phase: i64,
        max_workers: usize,
        jobs: &mpsc::Sender<Task>,
        reports: &mut mpsc::Receiver<TaskReport>,
        phase_result: &mut PhaseResult,
    ) -> Result<()> {
        loop {
            if self.budget.is_exhausted() {
                warn!(phase, usage = ?self.budget.usage(), "Invocation budget exhausted");
                phase_result.stopped_reason = Some(StopReason::InvocationLimit);
                return Ok(());
            }

            let reset = self.db.tasks().cleanup_stale_claims().await?;
            if reset > 0 {
                info!(phase, claims = reset, "Expired claims returned to pending before dispatch");
            }
            phase_result.stale_claims_reset += reset;

            let batch: Vec<Task> = self
                .db
                .tasks()
                .get_claimable_tasks(Some(phase))
                .await?
                .into_iter()
                .take(max_workers)
                .collect();
            if batch.is_empty() {
                debug!(phase, "No claimable tasks left");
                return Ok(());
            }

            let size = batch.len();
            debug!(phase, size, "Dispatching batch");
            for task in batch {
                jobs.send(task)
                    .await
                    .map_err(|_| SwarmError::WorkerError("every worker exited".to_string()))?;
            }

            let mut batch_reports = Vec::with_capacity(size);
            while batch_reports.len() < size {
                let report = reports
                    .recv()
                    .await
                    .ok_or_else(|| SwarmError::WorkerError("every worker exited mid-batch".to_string()))?;
                batch_reports.push(report);
            }

            let failed = batch_reports.iter().any(TaskReport::is_failure);
            let exhausted = batch_reports.iter().any(TaskReport::exhausted_budget);
            let progressed = batch_reports.iter().any(|r| r.is_success() || r.is_failure() || r.exhausted_budget());
            for report in &batch_reports {
                if report.is_failure() {
                    warn!(phase, task_key = %report.task_key, worker_id = %report.worker_id, "Task failed");
                }
            }
            phase_result.reports.extend(batch_reports);
            self.db.runs().set_invocations(run_id, self.budget.used()).await?;

            if failed {
                phase_result.stopped_reason = Some(StopReason::TaskFailure);
                return Ok(());
            }
            if exhausted {
                phase_result.stopped_reason = Some(StopReason::InvocationLimit);
                return Ok(());
            }
            if !progressed {
                warn!(phase, "Every claim in the batch was lost; ending the phase");
                return Ok(());
            }
        }
    }

    async fn sweep(&self, phase_result: &mut PhaseResult) -> Result<()> {
        let reset = self.db.tasks().cleanup_stale_claims().await?;
        phase_result.stale_claims_reset += reset;
        let reclaimed = self
            .db
            .workers()
            .reclaim_stale_workers(self.config.worker_stale_after())
            .await?;
        phase_result.workers_reclaimed = reclaimed.workers.len();
        if reset > 0 || !reclaimed.workers.is_empty() {
            warn!(
                phase = phase_result.phase,
                claims = reset,
                workers = ?reclaimed.workers,
                tasks = reclaimed.tasks_reset,
                "Stale work reclaimed"
            );
        }
        Ok(())
    }

    async fn merge(&self, phase_result: &mut PhaseResult) -> Result<()> {
        let branches: Vec<String> = phase_result
            .reports
            .iter()
            .filter_map(|r| r.merge_branch.clone())
            .collect();
        if branches.is_empty() {
            return Ok(());
        }

        let coordinator = MergeCoordinator::new(self.collaborators.git.clone(), self.collaborators.notifier.clone());
        let report = coordinator.merge_all(&branches).await?;
        phase_result.merged = report.merged;
        if report.conflict.is_some() && phase_result.stopped_reason.is_none() {
            phase_result.stopped_reason = Some(StopReason::MergeConflict);
        }
        Ok(())
    }

    async fn record_phase_health(&self, phase_result: &PhaseResult) {
        let identifier = format!("phase-{}", phase_result.phase);
        let recorded = if phase_result.is_clean() {
            self.circuits.record_success(CircuitLevel::System, &identifier).await
        } else {
            self.circuits.record_failure(CircuitLevel::System, &identifier).await
        };
        if let Err(e) = recorded {
            warn!(phase = phase_result.phase, error = %e, "Could not record phase health");
        }
    }

    fn worker(&self, id: WorkerId) -> Worker {
        let pipeline = PipelineRunner::new(
            self.db.clone(),
            self.collaborators.clone(),
            self.circuits.clone(),
            self.review_breaker.clone(),
            self.budget.clone(),
            PipelineSettings::from(&self.config),
        );
        Worker::new(
            id,
            self.db.clone(),
            pipeline,
            self.collaborators.git.clone(),
            self.circuits.clone(),
            WorkerSettings::from(&self.config),
        )
    }
}

/// One worker's life for a phase: register, take jobs until the queue
/// closes, unregister.
async fn worker_loop(worker: Worker, jobs: JobQueue, reports: mpsc::Sender<TaskReport>) {
    let heartbeat = match worker.start().await {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            error!(worker_id = %worker.id(), error = %e, "Worker failed to start");
            return;
        }
    };

    loop {
        let next = jobs.lock().await.recv().await;
        let Some(task) = next else { break };
        let report = worker.process_task(&task).await;
        if reports.send(report).await.is_err() {
            break;
        }
    }

    if let Err(e) = worker.stop(heartbeat).await {
        warn!(worker_id = %worker.id(), error = %e, "Worker failed to unregister");
    }
}
