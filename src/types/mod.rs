mod circuit_breaker;
mod identifiers;
mod review;
mod run;
mod stage;
mod task;
mod validation;
mod worker;

pub use circuit_breaker::{CircuitBreakerRecord, CircuitConfig, CircuitLevel, CircuitState};
pub use identifiers::{RunId, TaskId, TaskKey, WorkerId};
pub use review::{CheckOutcome, FileMetrics, ReviewResult, Severity, VerifyReport, Violation};
pub use run::{ExecutionRun, RunStatus, StopReason};
pub use stage::{AttemptOutcome, RefactorReason, Stage, StageRequest, StageVerdict};
pub use task::{Complexity, NewTask, ReleaseOutcome, Task, TaskStatus, TaskType};
pub use validation::{
    DanglingDependency, IncompleteTask, OrphanedTask, PhaseGateResult, RegressionFailure,
    RunValidationResult,
};
pub use worker::{WorkerRecord, WorkerStatus};
