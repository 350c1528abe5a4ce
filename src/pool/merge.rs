use crate::error::Result;
use crate::ports::{GitOps, MergeOutcome, Notifier};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub branch: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub merged: Vec<String>,
    pub conflict: Option<MergeConflict>,
    /// Branches left unmerged because an earlier one conflicted.
    pub skipped: Vec<String>,
}

/// Merges finished task branches into the base branch one at a time and stops
/// at the first conflict.
#[derive(Clone)]
pub struct MergeCoordinator {
    git: Arc<dyn GitOps>,
    notifier: Arc<dyn Notifier>,
}

impl MergeCoordinator {
    #[must_use]
    pub fn new(git: Arc<dyn GitOps>, notifier: Arc<dyn Notifier>) -> Self {
        Self { git, notifier }
    }

    /// # Errors
    /// Returns an error if git fails for a reason other than a conflict.
    pub async fn merge_all(&self, branches: &[String]) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let mut pending = branches.iter();

        for branch in pending.by_ref() {
            match self.git.merge_branch(branch).await? {
                MergeOutcome::Merged => {
                    info!(branch = %branch, "Merged task branch");
                    report.merged.push(branch.clone());
                }
                MergeOutcome::NothingToMerge => {
                    info!(branch = %branch, "Task branch had nothing to merge");
                }
                MergeOutcome::Conflict { files } => {
                    warn!(branch = %branch, files = ?files, "Merge conflict");
                    self.notify_conflict(branch, &files).await;
                    report.conflict = Some(MergeConflict {
                        branch: branch.clone(),
                        files,
                    });
                    break;
                }
            }
        }
        report.skipped = pending.cloned().collect();
        Ok(report)
    }

    async fn notify_conflict(&self, branch: &str, files: &[String]) {
        let subject = format!("Merge conflict on {branch}");
        let body = format!(
            "Branch {branch} conflicts with the base branch in:\n{}\n\nResolve manually and re-run.",
            files
                .iter()
                .map(|file| format!("  - {file}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        if let Err(e) = self.notifier.notify(&subject, &body).await {
            warn!(branch = %branch, error = %e, "Could not deliver merge-conflict notification");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::MergeCoordinator;
    use crate::adapters::{ScriptedProject, TaskScript};

    #[tokio::test]
    async fn merging_stops_at_the_first_conflict_and_notifies() {
        // Given
        let project = ScriptedProject::new();
        project
            .script("B", TaskScript::happy().conflicts_on(["src/shared.py", "src/util.py"]))
            .await;
        let collaborators = project.collaborators();
        let coordinator = MergeCoordinator::new(collaborators.git, collaborators.notifier);
        let branches = ["swarm/A", "swarm/B", "swarm/C"].map(String::from);

        // When
        let report = coordinator.merge_all(&branches).await.unwrap();

        // Then
        assert_eq!(report.merged, vec!["swarm/A".to_string()]);
        let conflict = report.conflict.unwrap();
        assert_eq!(conflict.branch, "swarm/B");
        assert_eq!(conflict.files.len(), 2);
        assert_eq!(report.skipped, vec!["swarm/C".to_string()]);

        let notifications = project.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].0.contains("swarm/B"));
        assert!(notifications[0].1.contains("src/shared.py"));
        assert!(notifications[0].1.contains("src/util.py"));
    }

    #[tokio::test]
    async fn clean_branches_all_merge_in_order() {
        let project = ScriptedProject::new();
        let collaborators = project.collaborators();
        let coordinator = MergeCoordinator::new(collaborators.git, collaborators.notifier);
        let branches = ["swarm/X", "swarm/Y"].map(String::from);

        let report = coordinator.merge_all(&branches).await.unwrap();

        assert_eq!(report.merged, branches.to_vec());
        assert!(report.conflict.is_none());
        assert!(project.notifications().await.is_empty());
    }
}
