#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use crate::error::{Result, SwarmError};
use crate::types::CircuitConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = ".swarm/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub database_path: String,
    pub max_workers: u32,
    pub max_invocations_per_session: u64,
    pub budget_warning_threshold: f64,
    pub claim_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub worker_stale_after_seconds: u64,
    pub max_green_attempts: u32,
    pub green_retry_delay_ms: u64,
    pub max_green_retry_time_seconds: u64,
    pub single_branch_mode: bool,
    pub enable_phase_gates: bool,
    pub restore_on_failure: bool,
    pub stage_timeout_seconds: u64,
    pub check_timeout_seconds: u64,
    pub red_fix_max_attempts: u32,
    pub red_fix_timeout_seconds: u64,
    pub review_breaker_threshold: u32,
    pub review_breaker_cooldown_seconds: u64,
    pub refactor: RefactorThresholds,
    pub circuit: CircuitSettings,
    pub commands: CommandTemplates,
    pub git: GitSettings,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            database_path: ".swarm/swarm.db".to_string(),
            max_workers: 2,
            max_invocations_per_session: 200,
            budget_warning_threshold: 0.8,
            claim_timeout_seconds: 1800,
            heartbeat_interval_seconds: 30,
            worker_stale_after_seconds: 90,
            max_green_attempts: 2,
            green_retry_delay_ms: 1000,
            max_green_retry_time_seconds: 1800,
            single_branch_mode: false,
            enable_phase_gates: true,
            restore_on_failure: false,
            stage_timeout_seconds: 600,
            check_timeout_seconds: 120,
            red_fix_max_attempts: 2,
            red_fix_timeout_seconds: 900,
            review_breaker_threshold: 3,
            review_breaker_cooldown_seconds: 300,
            refactor: RefactorThresholds::default(),
            circuit: CircuitSettings::default(),
            commands: CommandTemplates::default(),
            git: GitSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefactorThresholds {
    pub soft_file_lines: usize,
    pub hard_file_lines: usize,
    pub max_function_lines: usize,
    pub max_class_methods: usize,
}

impl Default for RefactorThresholds {
    fn default() -> Self {
        Self {
            soft_file_lines: 300,
            hard_file_lines: 500,
            max_function_lines: 50,
            max_class_methods: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown_seconds: 60,
        }
    }
}

impl From<CircuitSettings> for CircuitConfig {
    fn from(settings: CircuitSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            settings.success_threshold,
            settings.cooldown_seconds,
        )
    }
}

/// Shell templates for the command-backed collaborators.
///
/// Placeholders: `{task_key}`, `{test_file}`, `{impl_file}`, `{workdir}`,
/// `{attempt}`; `regression` additionally receives `{test_files}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub red: String,
    pub red_fix: String,
    pub green: String,
    pub refactor: String,
    pub fix: String,
    pub review: String,
    pub test: String,
    pub lint: String,
    pub typecheck: String,
    pub static_analysis: String,
    pub regression: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            red: "swarm-agent red {task_key}".to_string(),
            red_fix: "swarm-agent red-fix {task_key} --attempt {attempt}".to_string(),
            green: "swarm-agent green {task_key} --attempt {attempt}".to_string(),
            refactor: "swarm-agent refactor {task_key}".to_string(),
            fix: "swarm-agent fix {task_key}".to_string(),
            review: "swarm-review --json {test_file}".to_string(),
            test: "python -m pytest -q {test_file}".to_string(),
            lint: "ruff check .".to_string(),
            typecheck: "mypy .".to_string(),
            static_analysis: "ruff check {impl_file}".to_string(),
            regression: "python -m pytest -q {test_files}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub base_branch: String,
    pub branch_prefix: String,
    pub worktree_root: String,
    pub push_remote: Option<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: "swarm".to_string(),
            worktree_root: ".swarm/worktrees".to_string(),
            push_remote: None,
        }
    }
}

impl SwarmConfig {
    #[must_use]
    pub const fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn worker_stale_after(&self) -> Duration {
        Duration::from_secs(self.worker_stale_after_seconds)
    }

    #[must_use]
    pub const fn green_retry_delay(&self) -> Duration {
        Duration::from_millis(self.green_retry_delay_ms)
    }

    #[must_use]
    pub const fn max_green_retry_time(&self) -> Duration {
        Duration::from_secs(self.max_green_retry_time_seconds)
    }

    #[must_use]
    pub const fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_seconds)
    }

    #[must_use]
    pub const fn red_fix_timeout(&self) -> Duration {
        Duration::from_secs(self.red_fix_timeout_seconds)
    }

    #[must_use]
    pub const fn review_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.review_breaker_cooldown_seconds)
    }

    /// Rejects values outside the supported ranges.
    ///
    /// # Errors
    /// Returns `SwarmError::ConfigError` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers < 1 {
            return Err(invalid("max_workers", "must be at least 1"));
        }
        if !(self.budget_warning_threshold > 0.0 && self.budget_warning_threshold <= 1.0) {
            return Err(invalid("budget_warning_threshold", "must be in (0, 1]"));
        }
        if !(1..=10).contains(&self.max_green_attempts) {
            return Err(invalid("max_green_attempts", "must be between 1 and 10"));
        }
        if self.green_retry_delay_ms > 10_000 {
            return Err(invalid("green_retry_delay_ms", "must be between 0 and 10000"));
        }
        if !(60..=7200).contains(&self.max_green_retry_time_seconds) {
            return Err(invalid(
                "max_green_retry_time_seconds",
                "must be between 60 and 7200",
            ));
        }
        if self.red_fix_max_attempts < 1 {
            return Err(invalid("red_fix_max_attempts", "must be at least 1"));
        }
        if self.refactor.soft_file_lines > self.refactor.hard_file_lines {
            return Err(invalid(
                "refactor.soft_file_lines",
                "must not exceed refactor.hard_file_lines",
            ));
        }
        if self.stage_timeout_seconds == 0 || self.check_timeout_seconds == 0 {
            return Err(invalid("stage_timeout_seconds", "timeouts must be positive"));
        }
        Ok(())
    }

    /// Applies `SWARM_*` overrides using the given lookup.
    ///
    /// # Errors
    /// Returns `SwarmError::ConfigError` when an override does not parse.
    pub fn apply_env_overrides_from<F>(mut self, env_lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| {
            env_lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(path) = lookup("SWARM_DB_PATH") {
            self.database_path = path;
        }
        if let Some(raw) = lookup("SWARM_MAX_WORKERS") {
            self.max_workers = parse_override("SWARM_MAX_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("SWARM_MAX_INVOCATIONS") {
            self.max_invocations_per_session = parse_override("SWARM_MAX_INVOCATIONS", &raw)?;
        }
        self.database_path = expand_env_vars(&self.database_path, &env_lookup);
        Ok(self)
    }
}

/// Loads the TOML config (defaults when the file is absent), applies process
/// environment overrides and validates the result.
///
/// # Errors
/// Returns `SwarmError::ConfigError` on unreadable, malformed or out-of-range config.
pub async fn load_config(path: Option<PathBuf>) -> Result<SwarmConfig> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let parsed = read_config_file(&config_path).await?;
    let config = parsed.apply_env_overrides_from(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

async fn read_config_file(path: &Path) -> Result<SwarmConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(SwarmConfig::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SwarmError::ConfigError(format!("Failed to read config: {e}")))?;
    parse_config_content(&content)
}

/// # Errors
/// Returns `SwarmError::ConfigError` when the TOML is malformed.
pub fn parse_config_content(content: &str) -> Result<SwarmConfig> {
    toml::from_str(content)
        .map_err(|e| SwarmError::ConfigError(format!("Failed to parse config: {e}")))
}

fn parse_override<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| SwarmError::ConfigError(format!("{name} has invalid value '{raw}'")))
}

fn invalid(key: &str, reason: &str) -> SwarmError {
    SwarmError::ConfigError(format!("{key} {reason}"))
}

/// Expands `${VAR}` and `${VAR:-default}` references.
fn expand_env_vars<F>(input: &str, env_lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = input.to_string();
    let mut cursor = 0;
    while let Some(offset) = result[cursor..].find("${") {
        let start = cursor + offset;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_part = &result[start + 2..start + end];
        let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
        let value = env_lookup(var_name).unwrap_or_else(|| default.to_string());
        result.replace_range(start..=(start + end), &value);
        cursor = start + value.len();
    }
    result
}
