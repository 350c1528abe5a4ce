//! Concrete collaborators: shell-command agents and checks, the `git` CLI,
//! file metrics, notifications, and the scripted in-memory project.

mod command_checks;
mod command_stage;
mod file_metrics;
mod git_cli;
mod log_notifier;
mod scripted;
pub mod shell;

pub use command_checks::{parse_review_output, CommandChecks};
pub use command_stage::CommandStageExecutor;
pub use file_metrics::{measure_source, IndentMetricsInspector};
pub use git_cli::GitCli;
pub use log_notifier::LogNotifier;
pub use scripted::{ScriptedProject, StageCall, TaskScript};
