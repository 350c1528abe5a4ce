use super::shell::{render_command, run_shell_command, CommandOutput, CommandVars, ShellOptions};
use crate::config::CommandTemplates;
use crate::error::{Result, SwarmError};
use crate::ports::{PortFuture, ProjectChecker, RegressionRunner, Reviewer, StageContext, Verifier};
use crate::types::{CheckOutcome, ReviewResult, VerifyReport, Violation};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Review, verification and project checks backed by shell commands.
///
/// Per-task checks run in the task's working directory; regression and
/// project-wide checks run in `project_root`.
#[derive(Debug, Clone)]
pub struct CommandChecks {
    templates: CommandTemplates,
    project_root: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReviewPayload {
    Wrapped { violations: Vec<Violation> },
    Bare(Vec<Violation>),
}

impl CommandChecks {
    #[must_use]
    pub fn new(templates: CommandTemplates, project_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            templates,
            project_root: project_root.into(),
            timeout,
        }
    }

    async fn check(&self, template: &str, vars: &CommandVars<'_>, workdir: PathBuf) -> Result<CheckOutcome> {
        let command = render_command(template, vars);
        let output = run_shell_command(&command, &ShellOptions::new(self.timeout).in_dir(workdir)).await?;
        Ok(to_check(output))
    }
}

fn to_check(output: CommandOutput) -> CheckOutcome {
    if output.success {
        CheckOutcome::pass(output.message)
    } else {
        CheckOutcome::fail(output.message)
    }
}

/// Parses reviewer stdout. Reviewers commonly exit non-zero when they find
/// violations, so the exit status is ignored whenever the payload parses.
///
/// # Errors
/// Returns `CollaboratorError` when the output is neither empty nor valid JSON.
pub fn parse_review_output(output: &CommandOutput) -> Result<ReviewResult> {
    let payload = output.message.trim();
    if payload.is_empty() {
        return if output.success && !output.timed_out {
            Ok(ReviewResult::clean())
        } else {
            Err(SwarmError::CollaboratorError(
                "Reviewer failed without output".to_string(),
            ))
        };
    }
    match serde_json::from_str::<ReviewPayload>(payload) {
        Ok(ReviewPayload::Wrapped { violations } | ReviewPayload::Bare(violations)) => {
            Ok(ReviewResult::from_violations(violations))
        }
        Err(e) => Err(SwarmError::CollaboratorError(format!(
            "Reviewer output is not valid JSON: {e}"
        ))),
    }
}

impl Reviewer for CommandChecks {
    fn review<'a>(&'a self, test_file: &'a str, context: &'a StageContext) -> PortFuture<'a, ReviewResult> {
        Box::pin(async move {
            let command = render_command(
                &self.templates.review,
                &CommandVars {
                    test_file,
                    workdir: Some(&context.workdir),
                    ..CommandVars::default()
                },
            );
            let output = run_shell_command(
                &command,
                &ShellOptions::new(self.timeout).in_dir(&context.workdir),
            )
            .await?;
            if output.timed_out {
                return Err(SwarmError::Timeout(output.message));
            }
            parse_review_output(&output)
        })
    }
}

impl Verifier for CommandChecks {
    fn run_tests<'a>(&'a self, test_file: &'a str, context: &'a StageContext) -> PortFuture<'a, CheckOutcome> {
        Box::pin(async move {
            let vars = CommandVars {
                test_file,
                workdir: Some(&context.workdir),
                ..CommandVars::default()
            };
            self.check(&self.templates.test, &vars, context.workdir.clone()).await
        })
    }

    fn verify_all<'a>(
        &'a self,
        test_file: &'a str,
        impl_file: &'a str,
        context: &'a StageContext,
    ) -> PortFuture<'a, VerifyReport> {
        Box::pin(async move {
            let vars = CommandVars {
                test_file,
                impl_file,
                workdir: Some(&context.workdir),
                ..CommandVars::default()
            };
            let dir = || context.workdir.clone();
            let (tests, lint, typecheck, static_analysis) = tokio::join!(
                self.check(&self.templates.test, &vars, dir()),
                self.check(&self.templates.lint, &vars, dir()),
                self.check(&self.templates.typecheck, &vars, dir()),
                self.check(&self.templates.static_analysis, &vars, dir()),
            );
            Ok(VerifyReport {
                tests: tests?,
                lint: lint?,
                typecheck: typecheck?,
                static_analysis: static_analysis?,
            })
        })
    }
}

impl RegressionRunner for CommandChecks {
    fn run<'a>(&'a self, test_files: &'a [String]) -> PortFuture<'a, CheckOutcome> {
        Box::pin(async move {
            let vars = CommandVars {
                workdir: Some(&self.project_root),
                test_files,
                ..CommandVars::default()
            };
            self.check(&self.templates.regression, &vars, self.project_root.clone())
                .await
        })
    }
}

impl ProjectChecker for CommandChecks {
    fn lint(&self) -> PortFuture<'_, CheckOutcome> {
        Box::pin(async move {
            let vars = CommandVars {
                workdir: Some(&self.project_root),
                ..CommandVars::default()
            };
            self.check(&self.templates.lint, &vars, self.project_root.clone())
                .await
        })
    }

    fn typecheck(&self) -> PortFuture<'_, CheckOutcome> {
        Box::pin(async move {
            let vars = CommandVars {
                workdir: Some(&self.project_root),
                ..CommandVars::default()
            };
            self.check(&self.templates.typecheck, &vars, self.project_root.clone())
                .await
        })
    }
}
