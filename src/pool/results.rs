use super::BudgetUsage;
use crate::types::{PhaseGateResult, RunId, RunValidationResult, StopReason, WorkerId};
use crate::worker::TaskReport;
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything one phase produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    pub phase: i64,
    pub reports: Vec<TaskReport>,
    /// Branches merged into the base branch after the phase, in merge order.
    pub merged: Vec<String>,
    pub stale_claims_reset: u64,
    pub workers_reclaimed: usize,
    pub stopped_reason: Option<StopReason>,
}

impl PhaseResult {
    #[must_use]
    pub const fn new(phase: i64) -> Self {
        Self {
            phase,
            reports: Vec::new(),
            merged: Vec::new(),
            stale_claims_reset: 0,
            workers_reclaimed: 0,
            stopped_reason: None,
        }
    }

    #[must_use]
    pub fn tasks_completed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    #[must_use]
    pub fn tasks_failed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_failure()).count()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stopped_reason.is_none() && self.tasks_failed() == 0
    }
}

/// What one worker got through over the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub phases: Vec<PhaseResult>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub stopped_reason: Option<StopReason>,
    /// Gate that refused to open a phase, when that stopped the run.
    pub failed_gate: Option<PhaseGateResult>,
    pub invocations: BudgetUsage,
    pub validation: Option<RunValidationResult>,
}

impl RunResult {
    #[must_use]
    pub const fn new(run_id: RunId, invocations: BudgetUsage) -> Self {
        Self {
            run_id,
            phases: Vec::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            stopped_reason: None,
            failed_gate: None,
            invocations,
            validation: None,
        }
    }

    pub(crate) fn absorb(&mut self, phase: PhaseResult) {
        self.tasks_completed += phase.tasks_completed();
        self.tasks_failed += phase.tasks_failed();
        if self.stopped_reason.is_none() {
            self.stopped_reason = phase.stopped_reason;
        }
        self.phases.push(phase);
    }

    pub(crate) fn stop(&mut self, reason: StopReason) {
        self.stopped_reason.get_or_insert(reason);
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stopped_reason.is_none()
            && self.tasks_failed == 0
            && self.validation.as_ref().is_none_or(|v| v.passed)
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Per-worker tallies across every phase, ordered by worker id. Lost
    /// claims count for neither side.
    #[must_use]
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        let mut by_worker: BTreeMap<WorkerId, WorkerStats> = BTreeMap::new();
        for report in self.phases.iter().flat_map(|p| &p.reports) {
            let stats = by_worker.entry(report.worker_id).or_insert(WorkerStats {
                worker_id: report.worker_id,
                completed: 0,
                failed: 0,
            });
            if report.is_success() {
                stats.completed += 1;
            } else if report.is_failure() {
                stats.failed += 1;
            }
        }
        by_worker.into_values().collect()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} completed, {} failed, {}/{} invocations",
            self.run_id,
            self.tasks_completed,
            self.tasks_failed,
            self.invocations.used,
            self.invocations.ceiling
        );
        if let Some(reason) = self.stopped_reason {
            summary.push_str(&format!(", stopped: {reason}"));
        }
        if let Some(validation) = &self.validation {
            summary.push_str(&format!(", validation: {}", validation.summary()));
        }
        let workers = self.worker_stats();
        if !workers.is_empty() {
            let per_worker = workers
                .iter()
                .map(|w| format!("{} {}/{}", w.worker_id, w.completed, w.failed))
                .collect::<Vec<_>>()
                .join(", ");
            summary.push_str(&format!("; completed/failed per worker: {per_worker}"));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::{PhaseResult, RunResult, WorkerStats};
    use crate::pipeline::PipelineOutcome;
    use crate::pool::InvocationBudget;
    use crate::types::{RunId, RunValidationResult, Stage, StopReason, TaskId, TaskKey, WorkerId};
    use crate::worker::{TaskDisposition, TaskReport};

    fn run() -> RunResult {
        RunResult::new(RunId::new(1), InvocationBudget::new(10, 0.8).usage())
    }

    #[test]
    fn first_stop_reason_wins() {
        let mut result = run();
        let mut phase = PhaseResult::new(1);
        phase.stopped_reason = Some(StopReason::TaskFailure);
        result.absorb(phase);
        result.stop(StopReason::MergeConflict);

        assert_eq!(result.stopped_reason, Some(StopReason::TaskFailure));
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn failed_validation_fails_an_otherwise_clean_run() {
        let mut result = run();
        result.absorb(PhaseResult::new(1));
        assert_eq!(result.exit_code(), 0);

        result.validation = Some(RunValidationResult::default());
        assert!(!result.is_success());
    }

    fn report(key: &str, worker: u32, disposition: TaskDisposition) -> TaskReport {
        TaskReport {
            task_id: TaskId::new(1),
            task_key: TaskKey::new(key),
            worker_id: WorkerId::new(worker),
            disposition,
            merge_branch: None,
        }
    }

    fn completed() -> TaskDisposition {
        TaskDisposition::Finished {
            outcome: PipelineOutcome::Complete {
                pre_implemented: false,
                refactored: false,
                fixed: false,
            },
        }
    }

    #[test]
    fn summary_breaks_results_down_by_worker() {
        let mut result = run();
        let mut first = PhaseResult::new(1);
        first.reports = vec![
            report("A", 2, completed()),
            report("B", 1, completed()),
            report("C", 2, TaskDisposition::ClaimLost),
        ];
        let mut second = PhaseResult::new(2);
        second.reports = vec![
            report("D", 1, completed()),
            report(
                "E",
                2,
                TaskDisposition::Finished {
                    outcome: PipelineOutcome::Failed {
                        stage: Stage::Green,
                        reason: "AssertionError".to_string(),
                    },
                },
            ),
        ];
        result.absorb(first);
        result.absorb(second);

        assert_eq!(
            result.worker_stats(),
            vec![
                WorkerStats { worker_id: WorkerId::new(1), completed: 2, failed: 0 },
                WorkerStats { worker_id: WorkerId::new(2), completed: 1, failed: 1 },
            ]
        );
        assert!(result
            .summary()
            .ends_with("; completed/failed per worker: worker-1 2/0, worker-2 1/1"));
    }
}
