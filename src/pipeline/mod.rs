//! Per-task stage state machine:
//! RED → RED_FIX loop → GREEN (retry + escalation) → VERIFY →
//! REFACTOR → RE_VERIFY, with a single FIX → RE_VERIFY on failure.

mod outcome;
mod refactor;

pub use outcome::PipelineOutcome;
pub use refactor::refactor_reasons;

use crate::config::{RefactorThresholds, SwarmConfig};
use crate::db::{StageAttemptEntry, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::pool::InvocationBudget;
use crate::ports::{Collaborators, StageContext, Workspace};
use crate::retry::{CircuitRegistry, RedFixAttemptTracker, StaticReviewCircuitBreaker};
use crate::types::{
    AttemptOutcome, CheckOutcome, CircuitLevel, ReviewResult, Stage, StageRequest, StageVerdict,
    Task, TaskType, VerifyReport, WorkerId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_green_attempts: u32,
    pub green_retry_delay: Duration,
    pub max_green_retry_time: Duration,
    pub stage_timeout: Duration,
    pub red_fix_max_attempts: u32,
    pub red_fix_timeout: Duration,
    pub refactor: RefactorThresholds,
}

impl From<&SwarmConfig> for PipelineSettings {
    fn from(config: &SwarmConfig) -> Self {
        Self {
            max_green_attempts: config.max_green_attempts,
            green_retry_delay: config.green_retry_delay(),
            max_green_retry_time: config.max_green_retry_time(),
            stage_timeout: config.stage_timeout(),
            red_fix_max_attempts: config.red_fix_max_attempts,
            red_fix_timeout: config.red_fix_timeout(),
            refactor: config.refactor,
        }
    }
}

/// Result of one StageExecutor call, after deadline and breaker handling.
#[derive(Debug, Clone)]
struct Invocation {
    verdict: StageVerdict,
    outcome: AttemptOutcome,
    duration_ms: u64,
}

impl Invocation {
    /// Re-grades the invocation after a follow-up check. Timeouts stay timeouts.
    fn judged(self, passed: bool, output: String) -> Self {
        let outcome = match (self.outcome, passed) {
            (AttemptOutcome::Timeout, _) => AttemptOutcome::Timeout,
            (_, true) => AttemptOutcome::Passed,
            (_, false) => AttemptOutcome::Failed,
        };
        Self {
            verdict: StageVerdict {
                success: passed,
                output,
            },
            outcome,
            duration_ms: self.duration_ms,
        }
    }

    const fn passed(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Passed)
    }
}

enum Dispatch {
    Ran(Invocation),
    OutOfBudget,
}

enum RefactorStep {
    NotNeeded,
    Applied,
    Abandoned,
}

struct TaskRun<'a> {
    task: &'a Task,
    workspace: &'a Workspace,
    context: StageContext,
}

/// Runs the stage sequence for one claimed task. Shared by all workers of a
/// pool; every piece of per-task state lives on the stack of [`Self::run`].
#[derive(Clone)]
pub struct PipelineRunner {
    db: SwarmDb,
    collaborators: Collaborators,
    circuits: CircuitRegistry,
    review_breaker: Arc<StaticReviewCircuitBreaker>,
    budget: Arc<InvocationBudget>,
    settings: PipelineSettings,
}

impl PipelineRunner {
    #[must_use]
    pub const fn new(
        db: SwarmDb,
        collaborators: Collaborators,
        circuits: CircuitRegistry,
        review_breaker: Arc<StaticReviewCircuitBreaker>,
        budget: Arc<InvocationBudget>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            collaborators,
            circuits,
            review_breaker,
            budget,
            settings,
        }
    }

    /// # Errors
    /// Returns an error only when the store or git fails; stage failures are
    /// reported through [`PipelineOutcome`].
    pub async fn run(
        &self,
        task: &Task,
        workspace: &Workspace,
        worker_id: WorkerId,
    ) -> Result<PipelineOutcome> {
        let run = TaskRun {
            task,
            workspace,
            context: StageContext::for_workspace(worker_id, workspace),
        };
        info!(task_key = %task.task_key, %worker_id, branch = %workspace.branch, "Pipeline started");

        let red = match self.dispatch(&run, &StageRequest::Red).await? {
            Dispatch::Ran(invocation) => invocation,
            Dispatch::OutOfBudget => return Ok(PipelineOutcome::BudgetExhausted { stage: Stage::Red }),
        };
        if !red.verdict.success {
            self.audit(&run, &StageRequest::Red, &red).await?;
            return Ok(PipelineOutcome::Failed {
                stage: Stage::Red,
                reason: red.verdict.output,
            });
        }

        // RED succeeds only when the freshly written tests fail.
        let tests = match self
            .collaborators
            .verifier
            .run_tests(&task.test_file, &run.context)
            .await
        {
            Ok(tests) => tests,
            Err(e) => {
                let red = red.judged(false, format!("could not run tests: {e}"));
                self.audit(&run, &StageRequest::Red, &red).await?;
                return Ok(PipelineOutcome::Failed {
                    stage: Stage::Red,
                    reason: red.verdict.output,
                });
            }
        };
        let pre_implemented = tests.passed && task.task_type == TaskType::VerifyOnly;
        if tests.passed && !pre_implemented {
            let red = red.judged(false, format!("tests pass before implementation:\n{}", tests.output));
            self.audit(&run, &StageRequest::Red, &red).await?;
            return Ok(PipelineOutcome::Failed {
                stage: Stage::Red,
                reason: "tests pass before any implementation exists".to_string(),
            });
        }
        let red = red.judged(true, tests.output);
        self.audit(&run, &StageRequest::Red, &red).await?;
        self.commit(&run, Stage::Red).await?;

        if pre_implemented {
            info!(task_key = %task.task_key, "Tests already pass; skipping RED_FIX and GREEN");
        } else {
            if let Some(stop) = self.red_fix_loop(&run).await? {
                return Ok(stop);
            }
            if let Some(stop) = self.green(&run).await? {
                return Ok(stop);
            }
        }

        self.verify_and_finish(&run, pre_implemented).await
    }

    async fn red_fix_loop(&self, run: &TaskRun<'_>) -> Result<Option<PipelineOutcome>> {
        let mut tracker = RedFixAttemptTracker::new(
            self.settings.red_fix_max_attempts,
            self.settings.red_fix_timeout,
            self.db.clock(),
        );

        loop {
            let next_attempt = tracker.attempts() + 1;
            let Some(review) = self.review(run, next_attempt).await? else {
                return Ok(None);
            };
            if !review.is_blocking {
                return Ok(None);
            }
            if let Err(denial) = tracker.can_attempt() {
                warn!(task_key = %run.task.task_key, reason = %denial, "Static review still blocking");
                return Ok(Some(PipelineOutcome::BlockedStaticReview {
                    reason: denial.to_string(),
                    violations: review.violations,
                }));
            }

            let request = StageRequest::RedFix {
                attempt: next_attempt,
                violations: review.violations.clone(),
            };
            let invocation = match self.dispatch(run, &request).await? {
                Dispatch::Ran(invocation) => invocation,
                Dispatch::OutOfBudget => {
                    return Ok(Some(PipelineOutcome::BudgetExhausted { stage: Stage::RedFix }))
                }
            };
            self.audit(run, &request, &invocation).await?;
            tracker.record_attempt(&review.violations);
            if invocation.passed() {
                self.commit(run, Stage::RedFix).await?;
            }
        }
    }

    /// `None` means review was skipped: the breaker is open or the reviewer
    /// crashed. Both are recorded as skipped attempts.
    async fn review(&self, run: &TaskRun<'_>, attempt: u32) -> Result<Option<ReviewResult>> {
        if !self.review_breaker.is_enabled() {
            self.audit_skipped(run, attempt, "static review disabled by circuit breaker".to_string())
                .await?;
            return Ok(None);
        }

        match self
            .collaborators
            .reviewer
            .review(&run.task.test_file, &run.context)
            .await
        {
            Ok(review) => {
                self.review_breaker.record_success();
                Ok(Some(review))
            }
            Err(e) => {
                warn!(task_key = %run.task.task_key, error = %e, "Reviewer failed; continuing without review");
                self.review_breaker.record_failure();
                self.audit_skipped(run, attempt, format!("reviewer failed: {e}")).await?;
                Ok(None)
            }
        }
    }

    async fn green(&self, run: &TaskRun<'_>) -> Result<Option<PipelineOutcome>> {
        let clock = self.db.clock();
        let started = clock.now();
        let mut prior_failure: Option<String> = None;

        for attempt in 1..=self.settings.max_green_attempts {
            if attempt > 1 {
                let elapsed = (clock.now() - started).to_std().unwrap_or_default();
                if elapsed >= self.settings.max_green_retry_time {
                    warn!(task_key = %run.task.task_key, attempt, "GREEN retry time budget exhausted");
                    break;
                }
                if !self.settings.green_retry_delay.is_zero() {
                    tokio::time::sleep(self.settings.green_retry_delay).await;
                }
            }

            let request = StageRequest::Green {
                attempt,
                escalated: attempt > 1,
                prior_failure: prior_failure.clone(),
            };
            let invocation = match self.dispatch(run, &request).await? {
                Dispatch::Ran(invocation) => invocation,
                Dispatch::OutOfBudget => {
                    return Ok(Some(PipelineOutcome::BudgetExhausted { stage: Stage::Green }))
                }
            };
            let invocation = if invocation.verdict.success {
                let tests = self.check_tests(run).await;
                invocation.judged(tests.passed, tests.output)
            } else {
                invocation
            };
            self.audit(run, &request, &invocation).await?;

            if invocation.passed() {
                self.commit(run, Stage::Green).await?;
                return Ok(None);
            }
            debug!(task_key = %run.task.task_key, attempt, "GREEN attempt failed");
            prior_failure = Some(invocation.verdict.output);
        }

        Ok(Some(PipelineOutcome::Failed {
            stage: Stage::Green,
            reason: prior_failure.unwrap_or_else(|| "GREEN was never attempted".to_string()),
        }))
    }

    async fn verify_and_finish(&self, run: &TaskRun<'_>, pre_implemented: bool) -> Result<PipelineOutcome> {
        let report = self.verify(run, Stage::Verify).await?;
        if !report.passed() {
            return self
                .fix(run, report.failure_summary(), pre_implemented, false)
                .await;
        }

        match self.refactor(run).await? {
            RefactorStep::NotNeeded | RefactorStep::Abandoned => Ok(PipelineOutcome::Complete {
                pre_implemented,
                refactored: false,
                fixed: false,
            }),
            RefactorStep::Applied => {
                let report = self.verify(run, Stage::ReVerify).await?;
                if report.passed() {
                    return Ok(PipelineOutcome::Complete {
                        pre_implemented,
                        refactored: true,
                        fixed: false,
                    });
                }
                self.fix(run, report.failure_summary(), pre_implemented, true)
                    .await
            }
        }
    }

    async fn refactor(&self, run: &TaskRun<'_>) -> Result<RefactorStep> {
        let path = run.workspace.workdir.join(&run.task.impl_file);
        let metrics = match self.collaborators.inspector.inspect(&path).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(task_key = %run.task.task_key, error = %e, "Could not measure implementation; skipping REFACTOR");
                return Ok(RefactorStep::NotNeeded);
            }
        };
        let reasons = refactor_reasons(&metrics, &self.settings.refactor);
        if reasons.is_empty() {
            return Ok(RefactorStep::NotNeeded);
        }
        info!(task_key = %run.task.task_key, reasons = reasons.len(), "REFACTOR triggered");

        let request = StageRequest::Refactor { reasons };
        let invocation = match self.dispatch(run, &request).await? {
            Dispatch::Ran(invocation) => invocation,
            Dispatch::OutOfBudget => {
                warn!(task_key = %run.task.task_key, "No budget left for REFACTOR; keeping verified implementation");
                return Ok(RefactorStep::Abandoned);
            }
        };
        self.audit(run, &request, &invocation).await?;
        if !invocation.passed() {
            warn!(task_key = %run.task.task_key, "REFACTOR failed; keeping verified implementation");
            self.collaborators
                .git
                .discard_changes(run.workspace, run.task)
                .await?;
            return Ok(RefactorStep::Abandoned);
        }
        self.commit(run, Stage::Refactor).await?;
        Ok(RefactorStep::Applied)
    }

    async fn fix(
        &self,
        run: &TaskRun<'_>,
        failure_output: String,
        pre_implemented: bool,
        refactored: bool,
    ) -> Result<PipelineOutcome> {
        let request = StageRequest::Fix { failure_output };
        let invocation = match self.dispatch(run, &request).await? {
            Dispatch::Ran(invocation) => invocation,
            Dispatch::OutOfBudget => return Ok(PipelineOutcome::BudgetExhausted { stage: Stage::Fix }),
        };
        self.audit(run, &request, &invocation).await?;
        if invocation.passed() {
            self.commit(run, Stage::Fix).await?;
        }

        let report = self.verify(run, Stage::ReVerify).await?;
        if report.passed() {
            Ok(PipelineOutcome::Complete {
                pre_implemented,
                refactored,
                fixed: true,
            })
        } else {
            Ok(PipelineOutcome::Failed {
                stage: Stage::ReVerify,
                reason: report.failure_summary(),
            })
        }
    }

    async fn verify(&self, run: &TaskRun<'_>, stage: Stage) -> Result<VerifyReport> {
        let started = Instant::now();
        let report = match self
            .collaborators
            .verifier
            .verify_all(&run.task.test_file, &run.task.impl_file, &run.context)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(task_key = %run.task.task_key, %stage, error = %e, "Verifier failed");
                VerifyReport {
                    tests: CheckOutcome::fail(format!("verifier failed: {e}")),
                    lint: CheckOutcome::pass("not run"),
                    typecheck: CheckOutcome::pass("not run"),
                    static_analysis: CheckOutcome::pass("not run"),
                }
            }
        };

        let (outcome, output) = if report.passed() {
            (AttemptOutcome::Passed, "all checks passed".to_string())
        } else {
            (AttemptOutcome::Failed, report.failure_summary())
        };
        self.db
            .audit()
            .record_stage_attempt(&StageAttemptEntry {
                task_id: run.task.id,
                worker_id: Some(run.context.worker_id),
                stage,
                attempt: 1,
                escalated: false,
                outcome,
                output,
                duration_ms: elapsed_ms(started),
            })
            .await?;
        info!(task_key = %run.task.task_key, %stage, passed = report.passed(), "Verification finished");
        Ok(report)
    }

    async fn check_tests(&self, run: &TaskRun<'_>) -> CheckOutcome {
        self.collaborators
            .verifier
            .run_tests(&run.task.test_file, &run.context)
            .await
            .unwrap_or_else(|e| CheckOutcome::fail(format!("could not run tests: {e}")))
    }

    /// One StageExecutor call behind the stage breaker, the budget and the
    /// stage deadline. Executor errors and timeouts become failed verdicts.
    async fn dispatch(&self, run: &TaskRun<'_>, request: &StageRequest) -> Result<Dispatch> {
        let stage = request.stage();
        if !self.circuits.allows(CircuitLevel::Stage, stage.as_str()).await? {
            warn!(task_key = %run.task.task_key, %stage, "Stage circuit open; failing fast");
            return Ok(Dispatch::Ran(Invocation {
                verdict: StageVerdict::failed(format!("circuit open for stage {stage}")),
                outcome: AttemptOutcome::Failed,
                duration_ms: 0,
            }));
        }
        if !self.budget.try_consume() {
            warn!(task_key = %run.task.task_key, %stage, "Invocation budget exhausted");
            return Ok(Dispatch::OutOfBudget);
        }

        let started = Instant::now();
        let call = self
            .collaborators
            .executor
            .execute(request, run.task, &run.context);
        let (verdict, outcome) = match tokio::time::timeout(self.settings.stage_timeout, call).await {
            Ok(Ok(verdict)) => {
                self.circuits
                    .record_success(CircuitLevel::Stage, stage.as_str())
                    .await?;
                let outcome = if verdict.success {
                    AttemptOutcome::Passed
                } else {
                    AttemptOutcome::Failed
                };
                (verdict, outcome)
            }
            Ok(Err(SwarmError::Timeout(message))) => {
                self.circuits
                    .record_failure(CircuitLevel::Stage, stage.as_str())
                    .await?;
                (StageVerdict::failed(message), AttemptOutcome::Timeout)
            }
            Ok(Err(e)) => {
                warn!(task_key = %run.task.task_key, %stage, error = %e, "Stage executor error");
                self.circuits
                    .record_failure(CircuitLevel::Stage, stage.as_str())
                    .await?;
                (
                    StageVerdict::failed(format!("stage executor error: {e}")),
                    AttemptOutcome::Failed,
                )
            }
            Err(_) => {
                warn!(task_key = %run.task.task_key, %stage, "Stage deadline passed; abandoning call");
                self.circuits
                    .record_failure(CircuitLevel::Stage, stage.as_str())
                    .await?;
                (
                    StageVerdict::failed(format!(
                        "{stage} timed out after {}s",
                        self.settings.stage_timeout.as_secs()
                    )),
                    AttemptOutcome::Timeout,
                )
            }
        };

        Ok(Dispatch::Ran(Invocation {
            verdict,
            outcome,
            duration_ms: elapsed_ms(started),
        }))
    }

    async fn audit(&self, run: &TaskRun<'_>, request: &StageRequest, invocation: &Invocation) -> Result<()> {
        self.db
            .audit()
            .record_stage_attempt(&StageAttemptEntry {
                task_id: run.task.id,
                worker_id: Some(run.context.worker_id),
                stage: request.stage(),
                attempt: request.attempt(),
                escalated: request.is_escalated(),
                outcome: invocation.outcome,
                output: invocation.verdict.output.clone(),
                duration_ms: invocation.duration_ms,
            })
            .await
    }

    async fn audit_skipped(&self, run: &TaskRun<'_>, attempt: u32, reason: String) -> Result<()> {
        self.db
            .audit()
            .record_stage_attempt(&StageAttemptEntry {
                task_id: run.task.id,
                worker_id: Some(run.context.worker_id),
                stage: Stage::RedFix,
                attempt,
                escalated: false,
                outcome: AttemptOutcome::Skipped,
                output: reason,
                duration_ms: 0,
            })
            .await
    }

    async fn commit(&self, run: &TaskRun<'_>, stage: Stage) -> Result<()> {
        let committed = self
            .collaborators
            .git
            .commit_stage(run.workspace, run.task, stage)
            .await?;
        debug!(task_key = %run.task.task_key, %stage, committed, "Stage commit");
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
