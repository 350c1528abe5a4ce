use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "swarm")]
#[command(about = "Phase-gated TDD worker pool over a SQLite task store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (default: .swarm/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides `database_path` from the config
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// JSON output and JSON log lines
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

impl Cli {
    #[must_use]
    pub const fn output(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool over one phase or all of them
    Run(RunArgs),
    /// Task counts, workers and the latest run
    Status {
        #[arg(long)]
        phase: Option<i64>,
    },
    Circuits {
        #[command(subcommand)]
        action: CircuitAction,
    },
    Validate {
        #[command(subcommand)]
        target: ValidateTarget,
    },
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Use `--workers` workers; without it the pool runs one worker
    #[arg(long, default_value_t = false)]
    pub parallel: bool,

    #[arg(short, long)]
    pub workers: Option<u32>,

    #[arg(long, conflicts_with = "all_phases", required_unless_present = "all_phases")]
    pub phase: Option<i64>,

    #[arg(long, default_value_t = false)]
    pub all_phases: bool,

    /// Replay the plan against the in-memory project; the store is not touched
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum CircuitAction {
    Status,
    Health,
    Reset {
        #[arg(long, value_enum)]
        level: Option<LevelArg>,
        #[arg(long)]
        identifier: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ValidateTarget {
    /// Gate check for starting `phase`
    Phase { phase: i64 },
    /// End-of-run validation
    Run,
    /// Dependencies, then run validation
    All,
    Dependencies,
}

#[derive(Subcommand)]
pub enum TaskAction {
    /// Load a JSON array of tasks
    Import { file: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum LevelArg {
    Stage,
    Worker,
    System,
}

impl From<LevelArg> for swarm::CircuitLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Stage => Self::Stage,
            LevelArg::Worker => Self::Worker,
            LevelArg::System => Self::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands, ValidateTarget};
    use clap::Parser;

    #[test]
    fn run_requires_a_phase_or_all_phases() {
        assert!(Cli::try_parse_from(["swarm", "run"]).is_err());
        assert!(Cli::try_parse_from(["swarm", "run", "--phase", "1", "--all-phases"]).is_err());
        assert!(Cli::try_parse_from(["swarm", "run", "--parallel", "--workers", "4", "--phase", "2"]).is_ok());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["swarm", "validate", "phase", "3", "--json"]);
        assert!(cli.is_ok());
        if let Ok(cli) = cli {
            assert!(cli.json);
            assert!(matches!(cli.command, Commands::Validate { target: ValidateTarget::Phase { phase: 3 } }));
        }
    }
}
