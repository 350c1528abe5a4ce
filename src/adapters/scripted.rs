use crate::error::SwarmError;
use crate::ports::{
    BranchMode, Collaborators, FileInspector, GitOps, MergeOutcome, Notifier, PortFuture,
    ProjectChecker, RegressionRunner, Reviewer, StageContext, StageExecutor, Verifier, Workspace,
};
use crate::types::{
    CheckOutcome, FileMetrics, ReviewResult, Stage, StageRequest, StageVerdict, Task, TaskType,
    VerifyReport, WorkerId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How one task behaves inside a [`ScriptedProject`].
#[derive(Debug, Clone)]
pub struct TaskScript {
    already_implemented: bool,
    red_fails: bool,
    reviews: VecDeque<ReviewResult>,
    reviewer_crashes: bool,
    green_passes_on: Option<u32>,
    verify_failures: u32,
    fix_repairs: bool,
    metrics: FileMetrics,
    refactor_errors: bool,
    refactor_breaks_tests: bool,
    panic_on: Option<Stage>,
    stage_delay: Option<Duration>,
    merge_conflict: Vec<String>,
    regression_fails: bool,
}

impl Default for TaskScript {
    fn default() -> Self {
        Self {
            already_implemented: false,
            red_fails: false,
            reviews: VecDeque::new(),
            reviewer_crashes: false,
            green_passes_on: Some(1),
            verify_failures: 0,
            fix_repairs: true,
            metrics: FileMetrics::default(),
            refactor_errors: false,
            refactor_breaks_tests: false,
            panic_on: None,
            stage_delay: None,
            merge_conflict: Vec::new(),
            regression_fails: false,
        }
    }
}

impl TaskScript {
    /// Every stage succeeds on the first try.
    #[must_use]
    pub fn happy() -> Self {
        Self::default()
    }

    /// Tests already pass once RED has run.
    #[must_use]
    pub const fn already_implemented(mut self) -> Self {
        self.already_implemented = true;
        self
    }

    #[must_use]
    pub const fn red_fails(mut self) -> Self {
        self.red_fails = true;
        self
    }

    /// Successive review answers; once exhausted the review is clean.
    #[must_use]
    pub fn with_reviews(mut self, reviews: impl IntoIterator<Item = ReviewResult>) -> Self {
        self.reviews = reviews.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn reviewer_crashes(mut self) -> Self {
        self.reviewer_crashes = true;
        self
    }

    #[must_use]
    pub const fn green_passes_on(mut self, attempt: u32) -> Self {
        self.green_passes_on = Some(attempt);
        self
    }

    #[must_use]
    pub const fn green_never_passes(mut self) -> Self {
        self.green_passes_on = None;
        self
    }

    /// Number of VERIFY/RE_VERIFY runs that fail lint before a fix.
    #[must_use]
    pub const fn failing_verify(mut self, runs: u32) -> Self {
        self.verify_failures = runs;
        self
    }

    #[must_use]
    pub const fn fix_cannot_repair(mut self) -> Self {
        self.fix_repairs = false;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: FileMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub const fn refactor_errors(mut self) -> Self {
        self.refactor_errors = true;
        self
    }

    #[must_use]
    pub const fn refactor_breaks_tests(mut self) -> Self {
        self.refactor_breaks_tests = true;
        self
    }

    #[must_use]
    pub const fn panics_in(mut self, stage: Stage) -> Self {
        self.panic_on = Some(stage);
        self
    }

    #[must_use]
    pub const fn slow(mut self, delay: Duration) -> Self {
        self.stage_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn conflicts_on(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.merge_conflict = files.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn fails_regression(mut self) -> Self {
        self.regression_fails = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    pub task_key: String,
    pub stage: Stage,
    pub attempt: u32,
    pub escalated: bool,
}

#[derive(Debug, Default)]
struct ProjectState {
    scripts: HashMap<String, TaskScript>,
    by_test_file: HashMap<String, String>,
    by_impl_path: HashMap<PathBuf, String>,
    implemented: HashSet<String>,
    refactored: HashSet<String>,
    calls: Vec<StageCall>,
    reviews_run: usize,
    commits: Vec<(String, Stage)>,
    merged: Vec<String>,
    rolled_back: Vec<String>,
    restored: Vec<String>,
    discarded: Vec<String>,
    squashed: Vec<String>,
    pushed: Vec<String>,
    notifications: Vec<(String, String)>,
    lint_failure: Option<String>,
    typecheck_failure: Option<String>,
}

impl ProjectState {
    fn script(&self, key: &str) -> TaskScript {
        self.scripts.get(key).cloned().unwrap_or_default()
    }

    fn script_mut(&mut self, key: &str) -> &mut TaskScript {
        self.scripts.entry(key.to_string()).or_default()
    }

    fn key_for_test(&self, test_file: &str) -> Option<String> {
        self.by_test_file.get(test_file).cloned()
    }
}

/// In-memory stand-in for an agent-driven project: every collaborator port is
/// answered from per-task scripts. Backs `run --dry-run` and the scheduler
/// tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProject {
    state: Arc<Mutex<ProjectState>>,
}

impl ScriptedProject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, task_key: &str, script: TaskScript) {
        self.state
            .lock()
            .await
            .scripts
            .insert(task_key.to_string(), script);
    }

    pub async fn fail_project_lint(&self, output: &str) {
        self.state.lock().await.lint_failure = Some(output.to_string());
    }

    pub async fn fail_project_typecheck(&self, output: &str) {
        self.state.lock().await.typecheck_failure = Some(output.to_string());
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        let shared = Arc::new(self.clone());
        Collaborators {
            executor: shared.clone(),
            reviewer: shared.clone(),
            verifier: shared.clone(),
            regression: shared.clone(),
            checker: shared.clone(),
            inspector: shared.clone(),
            git: shared.clone(),
            notifier: shared,
        }
    }

    pub async fn calls(&self) -> Vec<StageCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_for(&self, task_key: &str) -> Vec<StageCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.task_key == task_key)
            .cloned()
            .collect()
    }

    /// Stages executed for `task_key`, in order.
    pub async fn stages_for(&self, task_key: &str) -> Vec<Stage> {
        self.calls_for(task_key)
            .await
            .into_iter()
            .map(|call| call.stage)
            .collect()
    }

    pub async fn reviews_run(&self) -> usize {
        self.state.lock().await.reviews_run
    }

    pub async fn commits_for(&self, task_key: &str) -> Vec<Stage> {
        self.state
            .lock()
            .await
            .commits
            .iter()
            .filter(|(key, _)| key == task_key)
            .map(|(_, stage)| *stage)
            .collect()
    }

    pub async fn merged(&self) -> Vec<String> {
        self.state.lock().await.merged.clone()
    }

    pub async fn rolled_back(&self) -> Vec<String> {
        self.state.lock().await.rolled_back.clone()
    }

    pub async fn restored(&self) -> Vec<String> {
        self.state.lock().await.restored.clone()
    }

    pub async fn discarded(&self) -> Vec<String> {
        self.state.lock().await.discarded.clone()
    }

    pub async fn squashed(&self) -> Vec<String> {
        self.state.lock().await.squashed.clone()
    }

    pub async fn pushed(&self) -> Vec<String> {
        self.state.lock().await.pushed.clone()
    }

    pub async fn notifications(&self) -> Vec<(String, String)> {
        self.state.lock().await.notifications.clone()
    }
}

fn key_of_branch(branch: &str) -> &str {
    branch.rsplit('/').next().unwrap_or(branch)
}

#[allow(clippy::panic)]
fn scripted_panic(task_key: &str, stage: Stage) -> ! {
    panic!("scripted panic in {stage} for {task_key}");
}

impl StageExecutor for ScriptedProject {
    fn execute<'a>(
        &'a self,
        request: &'a StageRequest,
        task: &'a Task,
        context: &'a StageContext,
    ) -> PortFuture<'a, StageVerdict> {
        Box::pin(async move {
            let key = task.task_key.value().to_string();
            let stage = request.stage();
            let script = {
                let mut state = self.state.lock().await;
                state
                    .by_test_file
                    .insert(task.test_file.clone(), key.clone());
                state
                    .by_impl_path
                    .insert(context.workdir.join(&task.impl_file), key.clone());
                state.calls.push(StageCall {
                    task_key: key.clone(),
                    stage,
                    attempt: request.attempt(),
                    escalated: request.is_escalated(),
                });
                state.script(&key)
            };

            if let Some(delay) = script.stage_delay {
                tokio::time::sleep(delay).await;
            }
            if script.panic_on == Some(stage) {
                scripted_panic(&key, stage);
            }

            let mut state = self.state.lock().await;
            let verdict = match request {
                StageRequest::Red if script.red_fails => StageVerdict::failed("agent produced no tests"),
                StageRequest::Red => {
                    if script.already_implemented || task.task_type == TaskType::VerifyOnly {
                        state.implemented.insert(key.clone());
                    }
                    StageVerdict::passed(format!("wrote {}", task.test_file))
                }
                StageRequest::RedFix { violations, .. } => {
                    StageVerdict::passed(format!("addressed {} violations", violations.len()))
                }
                StageRequest::Green { attempt, .. } => match script.green_passes_on {
                    Some(passes_on) if *attempt >= passes_on => {
                        state.implemented.insert(key.clone());
                        StageVerdict::passed(format!("implemented {}", task.impl_file))
                    }
                    _ => StageVerdict::failed(format!("AssertionError in {} (attempt {attempt})", task.test_file)),
                },
                StageRequest::Refactor { .. } if script.refactor_errors => {
                    return Err(SwarmError::CollaboratorError("refactor agent crashed".to_string()));
                }
                StageRequest::Refactor { .. } => {
                    state.refactored.insert(key.clone());
                    if script.refactor_breaks_tests {
                        state.script_mut(&key).verify_failures += 1;
                    }
                    StageVerdict::passed("refactored")
                }
                StageRequest::Fix { .. } => {
                    if script.fix_repairs {
                        state.script_mut(&key).verify_failures = 0;
                    }
                    StageVerdict::passed("applied fix")
                }
            };
            Ok(verdict)
        })
    }
}

impl Reviewer for ScriptedProject {
    fn review<'a>(&'a self, test_file: &'a str, _context: &'a StageContext) -> PortFuture<'a, ReviewResult> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.reviews_run += 1;
            let Some(key) = state.key_for_test(test_file) else {
                return Ok(ReviewResult::clean());
            };
            let script = state.script_mut(&key);
            if script.reviewer_crashes {
                return Err(SwarmError::CollaboratorError("reviewer crashed".to_string()));
            }
            Ok(script.reviews.pop_front().unwrap_or_default())
        })
    }
}

impl Verifier for ScriptedProject {
    fn run_tests<'a>(&'a self, test_file: &'a str, _context: &'a StageContext) -> PortFuture<'a, CheckOutcome> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let implemented = state
                .key_for_test(test_file)
                .is_some_and(|key| state.implemented.contains(&key));
            Ok(if implemented {
                CheckOutcome::pass(format!("{test_file}: all passed"))
            } else {
                CheckOutcome::fail(format!("{test_file}: 1 failed"))
            })
        })
    }

    fn verify_all<'a>(
        &'a self,
        test_file: &'a str,
        _impl_file: &'a str,
        context: &'a StageContext,
    ) -> PortFuture<'a, VerifyReport> {
        Box::pin(async move {
            let tests = self.run_tests(test_file, context).await?;
            let mut state = self.state.lock().await;
            let lint = match state.key_for_test(test_file) {
                Some(key) if state.script(&key).verify_failures > 0 => {
                    let script = state.script_mut(&key);
                    script.verify_failures -= 1;
                    CheckOutcome::fail("E302 expected 2 blank lines")
                }
                _ => CheckOutcome::pass(""),
            };
            Ok(VerifyReport {
                tests,
                lint,
                typecheck: CheckOutcome::pass(""),
                static_analysis: CheckOutcome::pass(""),
            })
        })
    }
}

impl RegressionRunner for ScriptedProject {
    fn run<'a>(&'a self, test_files: &'a [String]) -> PortFuture<'a, CheckOutcome> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let failing: Vec<&String> = test_files
                .iter()
                .filter(|file| {
                    state
                        .key_for_test(file)
                        .is_some_and(|key| state.script(&key).regression_fails)
                })
                .collect();
            Ok(if failing.is_empty() {
                CheckOutcome::pass(format!("{} files passed", test_files.len()))
            } else {
                CheckOutcome::fail(
                    failing
                        .iter()
                        .map(|file| format!("FAILED {file}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            })
        })
    }
}

impl ProjectChecker for ScriptedProject {
    fn lint(&self) -> PortFuture<'_, CheckOutcome> {
        Box::pin(async move {
            Ok(match self.state.lock().await.lint_failure.clone() {
                Some(output) => CheckOutcome::fail(output),
                None => CheckOutcome::pass(""),
            })
        })
    }

    fn typecheck(&self) -> PortFuture<'_, CheckOutcome> {
        Box::pin(async move {
            Ok(match self.state.lock().await.typecheck_failure.clone() {
                Some(output) => CheckOutcome::fail(output),
                None => CheckOutcome::pass(""),
            })
        })
    }
}

impl FileInspector for ScriptedProject {
    fn inspect<'a>(&'a self, path: &'a Path) -> PortFuture<'a, FileMetrics> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(match state.by_impl_path.get(path) {
                Some(key) if !state.refactored.contains(key) => state.script(key).metrics,
                _ => FileMetrics::default(),
            })
        })
    }
}

impl GitOps for ScriptedProject {
    fn prepare_workspace<'a>(
        &'a self,
        task: &'a Task,
        _worker_id: WorkerId,
        mode: BranchMode,
    ) -> PortFuture<'a, Workspace> {
        Box::pin(async move {
            Ok(match mode {
                BranchMode::PerTask => Workspace {
                    branch: format!("swarm/{}", task.task_key),
                    workdir: PathBuf::from("scripted").join(task.task_key.value()),
                    base_commit: Some("base".to_string()),
                    isolated: true,
                },
                BranchMode::SingleBranch => Workspace {
                    branch: "main".to_string(),
                    workdir: PathBuf::from("scripted"),
                    base_commit: Some(format!("before-{}", task.task_key)),
                    isolated: false,
                },
            })
        })
    }

    fn commit_stage<'a>(&'a self, _workspace: &'a Workspace, task: &'a Task, stage: Stage) -> PortFuture<'a, bool> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .commits
                .push((task.task_key.value().to_string(), stage));
            Ok(true)
        })
    }

    fn squash_task<'a>(&'a self, _workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .squashed
                .push(task.task_key.value().to_string());
            Ok(())
        })
    }

    fn push_branch<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().await.pushed.push(workspace.branch.clone());
            Ok(())
        })
    }

    fn rollback<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .rolled_back
                .push(workspace.branch.clone());
            Ok(())
        })
    }

    fn restore<'a>(&'a self, workspace: &'a Workspace, _task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let marker = workspace.base_commit.clone().unwrap_or_default();
            self.state.lock().await.restored.push(marker);
            Ok(())
        })
    }

    fn discard_changes<'a>(&'a self, _workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let key = task.task_key.value().to_string();
            state.refactored.remove(&key);
            state.discarded.push(key);
            Ok(())
        })
    }

    fn merge_branch<'a>(&'a self, branch: &'a str) -> PortFuture<'a, MergeOutcome> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let conflict = state.script(key_of_branch(branch)).merge_conflict;
            if !conflict.is_empty() {
                return Ok(MergeOutcome::Conflict { files: conflict });
            }
            state.merged.push(branch.to_string());
            Ok(MergeOutcome::Merged)
        })
    }
}

impl Notifier for ScriptedProject {
    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .notifications
                .push((subject.to_string(), body.to_string()));
            Ok(())
        })
    }
}
