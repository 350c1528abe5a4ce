use super::shell::{render_command, run_shell_command, CommandVars, ShellOptions};
use crate::config::CommandTemplates;
use crate::error::{Result, SwarmError};
use crate::ports::{PortFuture, StageContext, StageExecutor};
use crate::types::{StageRequest, StageVerdict, Task};
use std::time::Duration;
use tracing::debug;

/// Runs each stage as an external agent command rendered from the configured
/// templates. Stage-specific context travels in `SWARM_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandStageExecutor {
    templates: CommandTemplates,
    timeout: Duration,
}

impl CommandStageExecutor {
    #[must_use]
    pub const fn new(templates: CommandTemplates, timeout: Duration) -> Self {
        Self { templates, timeout }
    }

    fn template_for(&self, request: &StageRequest) -> &str {
        match request {
            StageRequest::Red => &self.templates.red,
            StageRequest::RedFix { .. } => &self.templates.red_fix,
            StageRequest::Green { .. } => &self.templates.green,
            StageRequest::Refactor { .. } => &self.templates.refactor,
            StageRequest::Fix { .. } => &self.templates.fix,
        }
    }
}

fn stage_environment(request: &StageRequest, task: &Task) -> Result<Vec<(String, String)>> {
    let mut env = vec![
        ("SWARM_STAGE".to_string(), request.stage().as_str().to_string()),
        ("SWARM_TASK_KEY".to_string(), task.task_key.to_string()),
        ("SWARM_ATTEMPT".to_string(), request.attempt().to_string()),
        (
            "SWARM_ACCEPTANCE_CRITERIA".to_string(),
            serde_json::to_string(&task.acceptance_criteria)?,
        ),
    ];
    match request {
        StageRequest::Red => {}
        StageRequest::RedFix { violations, .. } => {
            env.push(("SWARM_VIOLATIONS".to_string(), serde_json::to_string(violations)?));
        }
        StageRequest::Green {
            escalated,
            prior_failure,
            ..
        } => {
            env.push(("SWARM_ESCALATED".to_string(), escalated.to_string()));
            if let Some(failure) = prior_failure {
                env.push(("SWARM_PRIOR_FAILURE".to_string(), failure.clone()));
            }
        }
        StageRequest::Refactor { reasons } => {
            let rendered = reasons.iter().map(ToString::to_string).collect::<Vec<_>>();
            env.push((
                "SWARM_REFACTOR_REASONS".to_string(),
                serde_json::to_string(&rendered)?,
            ));
        }
        StageRequest::Fix { failure_output } => {
            env.push(("SWARM_FAILURE_OUTPUT".to_string(), failure_output.clone()));
        }
    }
    Ok(env)
}

impl StageExecutor for CommandStageExecutor {
    fn execute<'a>(
        &'a self,
        request: &'a StageRequest,
        task: &'a Task,
        context: &'a StageContext,
    ) -> PortFuture<'a, StageVerdict> {
        Box::pin(async move {
            let command = render_command(
                self.template_for(request),
                &CommandVars {
                    task_key: task.task_key.value(),
                    test_file: &task.test_file,
                    impl_file: &task.impl_file,
                    workdir: Some(&context.workdir),
                    attempt: request.attempt(),
                    test_files: &[],
                },
            );
            let options = stage_environment(request, task)?.into_iter().fold(
                ShellOptions::new(self.timeout).in_dir(&context.workdir),
                |options, (key, value)| options.with_env(key, value),
            );

            debug!(stage = %request.stage(), task_key = %task.task_key, %command, "Running stage command");
            let output = run_shell_command(&command, &options).await?;
            if output.timed_out {
                return Err(SwarmError::Timeout(output.message));
            }
            Ok(StageVerdict {
                success: output.success,
                output: output.message,
            })
        })
    }
}
