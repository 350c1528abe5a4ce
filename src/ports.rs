use crate::error::Result;
use crate::types::{
    CheckOutcome, FileMetrics, ReviewResult, Stage, StageRequest, StageVerdict, Task, VerifyReport,
    WorkerId,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where a task's work happens: the branch it lives on and the directory the
/// collaborators run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub branch: String,
    pub workdir: PathBuf,
    /// Commit the task started from; used to restore the shared branch.
    pub base_commit: Option<String>,
    /// True for a per-task branch, false for the shared single branch.
    pub isolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchMode {
    PerTask,
    SingleBranch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub worker_id: WorkerId,
    pub workdir: PathBuf,
    pub branch: String,
}

impl StageContext {
    #[must_use]
    pub fn for_workspace(worker_id: WorkerId, workspace: &Workspace) -> Self {
        Self {
            worker_id,
            workdir: workspace.workdir.clone(),
            branch: workspace.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    NothingToMerge,
    Conflict { files: Vec<String> },
}

pub trait StageExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: &'a StageRequest,
        task: &'a Task,
        context: &'a StageContext,
    ) -> PortFuture<'a, StageVerdict>;
}

pub trait Reviewer: Send + Sync {
    fn review<'a>(&'a self, test_file: &'a str, context: &'a StageContext)
        -> PortFuture<'a, ReviewResult>;
}

pub trait Verifier: Send + Sync {
    fn run_tests<'a>(
        &'a self,
        test_file: &'a str,
        context: &'a StageContext,
    ) -> PortFuture<'a, CheckOutcome>;

    fn verify_all<'a>(
        &'a self,
        test_file: &'a str,
        impl_file: &'a str,
        context: &'a StageContext,
    ) -> PortFuture<'a, VerifyReport>;
}

/// Runs a batch of test files against the integrated tree.
pub trait RegressionRunner: Send + Sync {
    fn run<'a>(&'a self, test_files: &'a [String]) -> PortFuture<'a, CheckOutcome>;
}

/// Project-wide checks used by end-of-run validation.
pub trait ProjectChecker: Send + Sync {
    fn lint(&self) -> PortFuture<'_, CheckOutcome>;
    fn typecheck(&self) -> PortFuture<'_, CheckOutcome>;
}

pub trait FileInspector: Send + Sync {
    fn inspect<'a>(&'a self, path: &'a Path) -> PortFuture<'a, FileMetrics>;
}

pub trait GitOps: Send + Sync {
    fn prepare_workspace<'a>(
        &'a self,
        task: &'a Task,
        worker_id: WorkerId,
        mode: BranchMode,
    ) -> PortFuture<'a, Workspace>;

    /// Commits whatever the stage produced. Returns `false` when there was
    /// nothing to commit.
    fn commit_stage<'a>(
        &'a self,
        workspace: &'a Workspace,
        task: &'a Task,
        stage: Stage,
    ) -> PortFuture<'a, bool>;

    /// Collapses the task's stage commits on the shared branch into one.
    fn squash_task<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()>;

    fn push_branch<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()>;

    /// Discards a per-task branch and its working directory.
    fn rollback<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()>;

    /// Removes the task's commits and edits from the branch it worked on,
    /// leaving work by other tasks in place.
    fn restore<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()>;

    /// Drops the task's uncommitted edits, back to its last stage commit.
    fn discard_changes<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()>;

    fn merge_branch<'a>(&'a self, branch: &'a str) -> PortFuture<'a, MergeOutcome>;
}

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> PortFuture<'a, ()>;
}

/// Everything a worker talks to besides the store.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn StageExecutor>,
    pub reviewer: Arc<dyn Reviewer>,
    pub verifier: Arc<dyn Verifier>,
    pub regression: Arc<dyn RegressionRunner>,
    pub checker: Arc<dyn ProjectChecker>,
    pub inspector: Arc<dyn FileInspector>,
    pub git: Arc<dyn GitOps>,
    pub notifier: Arc<dyn Notifier>,
}
