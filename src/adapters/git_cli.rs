use super::shell::{run_program_with_env, CommandOutput};
use crate::config::GitSettings;
use crate::error::{Result, SwarmError};
use crate::ports::{BranchMode, GitOps, MergeOutcome, PortFuture, Workspace};
use crate::types::{Stage, Task, WorkerId};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `GitOps` over the `git` binary. Per-task work lives in a worktree under
/// `worktree_root`; merges land on whatever the main checkout has checked out.
///
/// On a shared branch a task only ever stages its own test and impl files, and
/// squash/restore rewrite `base..HEAD` through a scratch index so commits made
/// by other tasks in the meantime survive.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
    settings: GitSettings,
    timeout: Duration,
}

impl GitCli {
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>, settings: GitSettings, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            settings,
            timeout,
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        self.git_env(dir, args, &[]).await
    }

    async fn git_env(&self, dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Result<CommandOutput> {
        debug!(dir = %dir.display(), ?args, "git");
        let output = run_program_with_env("git", args, dir, env, self.timeout).await?;
        if output.timed_out {
            return Err(SwarmError::Timeout(output.message));
        }
        Ok(output)
    }

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        self.git_ok_env(dir, args, &[]).await
    }

    async fn git_ok_env(&self, dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
        let output = self.git_env(dir, args, env).await?;
        if output.success {
            Ok(output.message.trim().to_string())
        } else {
            Err(SwarmError::GitError(format!(
                "git {} failed: {}",
                args.join(" "),
                output.message.trim()
            )))
        }
    }

    fn branch_for(&self, task: &Task) -> String {
        format!("{}/{}", self.settings.branch_prefix, task.task_key)
    }

    fn worktree_for(&self, task: &Task) -> PathBuf {
        let slug: String = task
            .task_key
            .value()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.repo_root.join(&self.settings.worktree_root).join(slug)
    }

    /// Stages the whole tree and commits it. Only safe in a worktree nobody
    /// else writes to.
    async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool> {
        self.git_ok(dir, &["add", "-A"]).await?;
        let staged = self.git(dir, &["diff", "--cached", "--quiet"]).await?;
        if staged.success {
            return Ok(false);
        }
        self.git_ok(dir, &["commit", "--no-verify", "-m", message]).await?;
        Ok(true)
    }

    /// Commits `paths` and nothing else, whatever else sits in the index.
    async fn commit_paths(&self, dir: &Path, message: &str, paths: &[&str]) -> Result<bool> {
        let present = self.known_paths(dir, paths).await?;
        if present.is_empty() {
            return Ok(false);
        }
        let mut add = vec!["add", "-A", "--"];
        add.extend(&present);
        self.git_ok(dir, &add).await?;

        let mut diff = vec!["diff", "--cached", "--quiet", "HEAD", "--"];
        diff.extend(&present);
        if self.git(dir, &diff).await?.success {
            return Ok(false);
        }
        let mut commit = vec!["commit", "--no-verify", "-m", message, "--"];
        commit.extend(&present);
        self.git_ok(dir, &commit).await?;
        Ok(true)
    }

    /// The subset of `paths` that exists on disk or is tracked; git rejects
    /// pathspecs matching neither.
    async fn known_paths<'p>(&self, dir: &Path, paths: &[&'p str]) -> Result<Vec<&'p str>> {
        let mut args = vec!["ls-files", "--"];
        args.extend(paths);
        let tracked = self.git_ok(dir, &args).await?;
        Ok(paths
            .iter()
            .copied()
            .filter(|p| dir.join(p).exists() || tracked.lines().any(|line| line.trim() == *p))
            .collect())
    }

    async fn rev_list(&self, dir: &Path, args: &[&str]) -> Result<Vec<String>> {
        let mut full = vec!["rev-list", "--reverse"];
        full.extend(args);
        let listing = self.git_ok(dir, &full).await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Stage commits the task made since `base`, oldest first.
    async fn task_commits(&self, dir: &Path, base: &str, task: &Task) -> Result<Vec<String>> {
        let grep = format!("--grep={}", stage_prefix(task));
        let range = format!("{base}..HEAD");
        self.rev_list(dir, &["--fixed-strings", &grep, &range]).await
    }

    /// Rebuilds `base..HEAD` without the commits in `mine`. Commits that came
    /// after the first of them are replayed with `paths` held at their `base`
    /// content. Neither the real index nor the working tree is touched.
    /// Returns the new tip.
    async fn replay_without(&self, dir: &Path, base: &str, mine: &[String], paths: &[&str]) -> Result<String> {
        let range = format!("{base}..HEAD");
        let history = self.rev_list(dir, &[&range]).await?;
        let scratch = self.git_ok(dir, &["rev-parse", "--git-path", "swarm-replay.index"]).await?;
        let scratch = dir.join(scratch).to_string_lossy().into_owned();
        let index_env = [("GIT_INDEX_FILE", scratch.as_str())];

        let mut parent = base.to_string();
        let mut rewriting = false;
        for commit in &history {
            if mine.contains(commit) {
                rewriting = true;
                continue;
            }
            if !rewriting {
                parent.clone_from(commit);
                continue;
            }
            self.git_ok_env(dir, &["read-tree", commit], &index_env).await?;
            let mut reset = vec!["reset", "-q", base, "--"];
            reset.extend(paths);
            self.git_ok_env(dir, &reset, &index_env).await?;
            let tree = self.git_ok_env(dir, &["write-tree"], &index_env).await?;

            let meta = self
                .git_ok(dir, &["log", "-1", "--format=%an%n%ae%n%aI%n%B", commit])
                .await?;
            let mut lines = meta.lines();
            let name = lines.next().unwrap_or_default().to_string();
            let email = lines.next().unwrap_or_default().to_string();
            let date = lines.next().unwrap_or_default().to_string();
            let message = lines.collect::<Vec<_>>().join("\n");
            let author_env = [
                ("GIT_AUTHOR_NAME", name.as_str()),
                ("GIT_AUTHOR_EMAIL", email.as_str()),
                ("GIT_AUTHOR_DATE", date.as_str()),
            ];
            parent = self
                .git_ok_env(dir, &["commit-tree", &tree, "-p", &parent, "-m", &message], &author_env)
                .await?;
        }
        let _ = tokio::fs::remove_file(&scratch).await;
        Ok(parent)
    }

    /// Puts `paths` in the index and working tree back to their content at
    /// `target`, deleting the ones `target` does not have.
    async fn reset_paths(&self, dir: &Path, target: &str, paths: &[&str]) -> Result<()> {
        let mut reset = vec!["reset", "-q", target, "--"];
        reset.extend(paths);
        self.git_ok(dir, &reset).await?;
        for path in paths {
            let spec = format!("{target}:{path}");
            if self.git(dir, &["cat-file", "-e", &spec]).await?.success {
                self.git_ok(dir, &["checkout", target, "--", path]).await?;
            } else {
                match tokio::fs::remove_file(dir.join(path)).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SwarmError::IoError(e)),
                }
            }
        }
        Ok(())
    }

    /// Where this task's work forked off HEAD. Falls back to the merge base
    /// when another task's squash rewrote the history below `base`.
    async fn fork_point(&self, dir: &Path, base: &str) -> Result<String> {
        self.git_ok(dir, &["merge-base", base, "HEAD"]).await
    }

    async fn conflicted_files(&self) -> Result<Vec<String>> {
        let listing = self
            .git_ok(&self.repo_root, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }
}

fn stage_prefix(task: &Task) -> String {
    format!("[swarm] {}: ", task.task_key)
}

/// Files a task owns on a shared branch.
fn own_paths(task: &Task) -> Vec<&str> {
    let mut paths: Vec<&str> = [task.test_file.as_str(), task.impl_file.as_str()]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    paths.dedup();
    paths
}

impl GitOps for GitCli {
    fn prepare_workspace<'a>(
        &'a self,
        task: &'a Task,
        worker_id: WorkerId,
        mode: BranchMode,
    ) -> PortFuture<'a, Workspace> {
        Box::pin(async move {
            match mode {
                BranchMode::SingleBranch => {
                    let branch = self
                        .git_ok(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
                        .await?;
                    let base = self.git_ok(&self.repo_root, &["rev-parse", "HEAD"]).await?;
                    Ok(Workspace {
                        branch,
                        workdir: self.repo_root.clone(),
                        base_commit: Some(base),
                        isolated: false,
                    })
                }
                BranchMode::PerTask => {
                    let branch = self.branch_for(task);
                    let workdir = self.worktree_for(task);
                    let workdir_str = workdir.to_string_lossy().into_owned();
                    if workdir.exists() {
                        warn!(%worker_id, path = %workdir.display(), "Removing leftover worktree");
                        self.git_ok(&self.repo_root, &["worktree", "remove", "--force", &workdir_str])
                            .await?;
                    }
                    self.git_ok(
                        &self.repo_root,
                        &["worktree", "add", "-B", &branch, &workdir_str, &self.settings.base_branch],
                    )
                    .await?;
                    let base = self.git_ok(&workdir, &["rev-parse", "HEAD"]).await?;
                    Ok(Workspace {
                        branch,
                        workdir,
                        base_commit: Some(base),
                        isolated: true,
                    })
                }
            }
        })
    }

    fn commit_stage<'a>(&'a self, workspace: &'a Workspace, task: &'a Task, stage: Stage) -> PortFuture<'a, bool> {
        Box::pin(async move {
            let message = format!("{}{stage}", stage_prefix(task));
            if workspace.isolated {
                self.commit_all(&workspace.workdir, &message).await
            } else {
                self.commit_paths(&workspace.workdir, &message, &own_paths(task)).await
            }
        })
    }

    fn squash_task<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let Some(base) = workspace.base_commit.as_deref() else {
                return Ok(());
            };
            let dir = &workspace.workdir;
            let message = format!("[swarm] {}: complete", task.task_key);
            if workspace.isolated {
                self.git_ok(dir, &["reset", "--soft", base]).await?;
                self.commit_all(dir, &message).await?;
                return Ok(());
            }

            let fork = self.fork_point(dir, base).await?;
            let mine = self.task_commits(dir, &fork, task).await?;
            if mine.is_empty() {
                return Ok(());
            }
            let others_tip = self.replay_without(dir, &fork, &mine, &own_paths(task)).await?;
            let tree = self.git_ok(dir, &["rev-parse", "HEAD^{tree}"]).await?;
            let squashed = self
                .git_ok(dir, &["commit-tree", &tree, "-p", &others_tip, "-m", &message])
                .await?;
            // same tree, so the index and working tree already match
            self.git_ok(dir, &["reset", "-q", "--soft", &squashed]).await?;
            info!(task_key = %task.task_key, commits = mine.len(), "Stage commits squashed");
            Ok(())
        })
    }

    fn push_branch<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let Some(remote) = self.settings.push_remote.as_deref() else {
                return Ok(());
            };
            self.git_ok(&workspace.workdir, &["push", remote, &workspace.branch])
                .await
                .map(|_| ())
        })
    }

    fn rollback<'a>(&'a self, workspace: &'a Workspace) -> PortFuture<'a, ()> {
        Box::pin(async move {
            if !workspace.isolated {
                return Ok(());
            }
            let path = workspace.workdir.to_string_lossy().into_owned();
            self.git_ok(&self.repo_root, &["worktree", "remove", "--force", &path])
                .await?;
            self.git_ok(&self.repo_root, &["branch", "-D", &workspace.branch])
                .await
                .map(|_| ())
        })
    }

    fn restore<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let Some(base) = workspace.base_commit.as_deref() else {
                return Ok(());
            };
            let dir = &workspace.workdir;
            if workspace.isolated {
                self.git_ok(dir, &["reset", "--hard", base]).await?;
                return self.git_ok(dir, &["clean", "-fd"]).await.map(|_| ());
            }

            let paths = own_paths(task);
            let fork = self.fork_point(dir, base).await?;
            let mine = self.task_commits(dir, &fork, task).await?;
            if !mine.is_empty() {
                let others_tip = self.replay_without(dir, &fork, &mine, &paths).await?;
                self.git_ok(dir, &["reset", "-q", "--soft", &others_tip]).await?;
            }
            self.reset_paths(dir, "HEAD", &paths).await?;
            info!(task_key = %task.task_key, commits = mine.len(), "Task work removed from shared branch");
            Ok(())
        })
    }

    fn discard_changes<'a>(&'a self, workspace: &'a Workspace, task: &'a Task) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let dir = &workspace.workdir;
            if workspace.isolated {
                self.git_ok(dir, &["reset", "-q", "--hard", "HEAD"]).await?;
                return self.git_ok(dir, &["clean", "-fd"]).await.map(|_| ());
            }
            self.reset_paths(dir, "HEAD", &own_paths(task)).await
        })
    }

    fn merge_branch<'a>(&'a self, branch: &'a str) -> PortFuture<'a, MergeOutcome> {
        Box::pin(async move {
            let merged = self
                .git(&self.repo_root, &["merge", "--no-ff", "--no-edit", branch])
                .await?;
            if merged.success {
                if merged.message.contains("Already up to date") {
                    return Ok(MergeOutcome::NothingToMerge);
                }
                return Ok(MergeOutcome::Merged);
            }

            let files = self.conflicted_files().await?;
            if files.is_empty() {
                return Err(SwarmError::GitError(format!(
                    "git merge {branch} failed: {}",
                    merged.message.trim()
                )));
            }
            self.git_ok(&self.repo_root, &["merge", "--abort"]).await?;
            Ok(MergeOutcome::Conflict { files })
        })
    }
}
