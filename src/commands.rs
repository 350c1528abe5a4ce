use crate::cli::{CircuitAction, Cli, Commands, OutputFormat, RunArgs, TaskAction, ValidateTarget};
use crate::output::emit_output;
use anyhow::Context;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm::adapters::{
    CommandChecks, CommandStageExecutor, GitCli, IndentMetricsInspector, LogNotifier, ScriptedProject,
};
use swarm::retry::CircuitRegistry;
use swarm::validation::{check_import, check_stored_dependencies, PhaseGateValidator, RunValidator};
use swarm::{Collaborators, NewTask, SwarmConfig, SwarmDb, SystemClock, TaskKey, WorkerPool};
use tracing::info;

/// Runs one CLI command and returns the process exit code.
pub async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    let output = cli.output();
    let mut config = swarm::load_config(cli.config.clone()).await?;
    if let Some(database) = &cli.database {
        config.database_path = database.display().to_string();
    }

    match cli.command {
        Commands::Run(args) => run_command(output, config, &args).await,
        Commands::Status { phase } => status_command(output, &config, phase).await,
        Commands::Circuits { action } => circuits_command(output, &config, action).await,
        Commands::Validate { target } => validate_command(output, &config, target).await,
        Commands::Tasks {
            action: TaskAction::Import { file },
        } => import_command(output, &config, &file).await,
    }
}

async fn open_db(config: &SwarmConfig) -> anyhow::Result<SwarmDb> {
    let path = PathBuf::from(&config.database_path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(SwarmDb::open(&path).await?)
}

fn project_root() -> anyhow::Result<PathBuf> {
    std::env::current_dir().context("resolving the project root")
}

/// Collaborators backed by the configured commands and the `git` CLI.
fn command_collaborators(config: &SwarmConfig, root: &Path) -> Collaborators {
    let checks = Arc::new(CommandChecks::new(
        config.commands.clone(),
        root,
        config.check_timeout(),
    ));
    Collaborators {
        executor: Arc::new(CommandStageExecutor::new(config.commands.clone(), config.stage_timeout())),
        reviewer: checks.clone(),
        verifier: checks.clone(),
        regression: checks.clone(),
        checker: checks,
        inspector: Arc::new(IndentMetricsInspector),
        git: Arc::new(GitCli::new(root, config.git.clone(), config.check_timeout())),
        notifier: Arc::new(LogNotifier),
    }
}

/// In-memory copy of the stored plan with every task back at `pending`.
async fn dry_run_db(source: &SwarmDb) -> anyhow::Result<SwarmDb> {
    let plan: Vec<NewTask> = source.tasks().list(None).await?.iter().map(NewTask::from).collect();
    let db = SwarmDb::in_memory(Arc::new(SystemClock)).await?;
    db.tasks().insert_many(&plan).await?;
    Ok(db)
}

async fn run_command(output: OutputFormat, mut config: SwarmConfig, args: &RunArgs) -> anyhow::Result<u8> {
    config.max_workers = match (args.parallel, args.workers) {
        (true, Some(workers)) => workers,
        (true, None) => config.max_workers,
        (false, _) => 1,
    };
    config.validate()?;

    let stored = open_db(&config).await?;
    let (db, collaborators) = if args.dry_run {
        info!("Dry run against the in-memory project");
        (dry_run_db(&stored).await?, ScriptedProject::new().collaborators())
    } else {
        (stored, command_collaborators(&config, &project_root()?))
    };

    let pool = WorkerPool::new(db, config, collaborators);
    let result = match (args.all_phases, args.phase) {
        (false, Some(phase)) => pool.run_parallel_phase(phase).await?,
        _ => pool.run_all_phases().await?,
    };

    emit_output(
        output,
        "run",
        result.is_success(),
        json!({
            "message": result.summary(),
            "dry_run": args.dry_run,
            "workers": result.worker_stats(),
            "result": result,
        }),
    );
    Ok(u8::try_from(result.exit_code()).unwrap_or(1))
}

async fn status_command(output: OutputFormat, config: &SwarmConfig, phase: Option<i64>) -> anyhow::Result<u8> {
    let db = open_db(config).await?;
    let counts = db.tasks().count_by_status(phase).await?;
    let workers = db.workers().list().await?;
    let latest = db.runs().latest().await?;

    let mut message = counts
        .iter()
        .map(|(status, count)| format!("{status:<22} {count}"))
        .collect::<Vec<_>>()
        .join("\n");
    message.push_str(&format!("\nworkers registered     {}", workers.len()));
    if let Some(run) = &latest {
        message.push_str(&format!(
            "\nlatest run             {} {}{}",
            run.id,
            run.status.as_str(),
            run.stopped_reason.map(|r| format!(" ({r})")).unwrap_or_default()
        ));
    }

    emit_output(
        output,
        "status",
        true,
        json!({
            "message": message,
            "phase": phase,
            "tasks": counts,
            "workers": workers,
            "latest_run": latest,
        }),
    );
    Ok(0)
}

async fn circuits_command(output: OutputFormat, config: &SwarmConfig, action: CircuitAction) -> anyhow::Result<u8> {
    let db = open_db(config).await?;
    let registry = CircuitRegistry::new(db, config.circuit.into());

    match action {
        CircuitAction::Status => {
            let records = registry.status().await?;
            let message = if records.is_empty() {
                "no circuit breakers recorded".to_string()
            } else {
                records
                    .iter()
                    .map(|r| {
                        format!(
                            "{:<7} {:<20} {:<10} failures={} successes={}",
                            r.level.as_str(),
                            r.identifier,
                            r.state.as_str(),
                            r.failure_count,
                            r.success_count
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            emit_output(output, "circuits status", true, json!({"message": message, "circuits": records}));
            Ok(0)
        }
        CircuitAction::Health => {
            let health = registry.health().await?;
            let message = format!(
                "closed={} open={} half_open={}",
                health.closed, health.open, health.half_open
            );
            emit_output(
                output,
                "circuits health",
                health.is_healthy(),
                json!({"message": message, "health": health}),
            );
            Ok(u8::from(!health.is_healthy()))
        }
        CircuitAction::Reset { level, identifier } => {
            let removed = registry.reset(level.map(Into::into), identifier.as_deref()).await?;
            emit_output(
                output,
                "circuits reset",
                true,
                json!({"message": format!("reset {removed} circuit breakers"), "removed": removed}),
            );
            Ok(0)
        }
    }
}

async fn validate_command(output: OutputFormat, config: &SwarmConfig, target: ValidateTarget) -> anyhow::Result<u8> {
    let db = open_db(config).await?;
    let collaborators = command_collaborators(config, &project_root()?);

    let (command, passed, payload) = match target {
        ValidateTarget::Phase { phase } => {
            let gate = PhaseGateValidator::new(db, collaborators.regression)
                .validate_phase(phase)
                .await?;
            (
                "validate phase",
                gate.passed,
                json!({"message": gate.summary(), "gate": gate}),
            )
        }
        ValidateTarget::Run => {
            let result = RunValidator::new(db, collaborators.regression, collaborators.checker)
                .validate_run()
                .await?;
            (
                "validate run",
                result.passed,
                json!({"message": result.summary(), "validation": result}),
            )
        }
        ValidateTarget::Dependencies => {
            let report = check_stored_dependencies(&db).await?;
            let message = dependency_message(&report);
            (
                "validate dependencies",
                report.is_valid(),
                json!({"message": message, "dependencies": report}),
            )
        }
        ValidateTarget::All => {
            let report = check_stored_dependencies(&db).await?;
            let result = RunValidator::new(db, collaborators.regression, collaborators.checker)
                .validate_run()
                .await?;
            let message = format!("{}\n{}", dependency_message(&report), result.summary());
            (
                "validate all",
                report.is_valid() && result.passed,
                json!({"message": message, "dependencies": report, "validation": result}),
            )
        }
    };

    emit_output(output, command, passed, payload);
    Ok(u8::from(!passed))
}

fn dependency_message(report: &swarm::validation::DependencyReport) -> String {
    if report.is_valid() {
        return "dependency graph is valid".to_string();
    }
    let mut lines: Vec<String> = report
        .dangling
        .iter()
        .map(|d| format!("{} depends on unknown task {}", d.task_key, d.missing))
        .collect();
    if let Some(cycle) = &report.cycle {
        lines.push(cycle.to_string());
    }
    lines.join("\n")
}

async fn import_command(output: OutputFormat, config: &SwarmConfig, file: &Path) -> anyhow::Result<u8> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let tasks: Vec<NewTask> = serde_json::from_str(&raw).map_err(swarm::SwarmError::from)?;

    let db = open_db(config).await?;
    let existing: HashSet<TaskKey> = db
        .tasks()
        .list(None)
        .await?
        .into_iter()
        .map(|t| t.task_key)
        .collect();
    let order = check_import(&tasks, &existing)?;
    let ids = db.tasks().insert_many(&tasks).await?;

    emit_output(
        output,
        "tasks import",
        true,
        json!({
            "message": format!("imported {} tasks from {}", ids.len(), file.display()),
            "imported": ids.len(),
            "order": order,
        }),
    );
    Ok(0)
}
