use assert_cmd::Command;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A scratch project directory with its own database, so every test runs the
/// binary against a fresh store and no config file.
pub struct CliHarness {
    dir: TempDir,
    binary_path: PathBuf,
}

pub struct CliRun {
    pub code: i32,
    pub stdout: String,
}

impl CliRun {
    pub fn json(&self) -> Result<Value, String> {
        serde_json::from_str::<Value>(self.stdout.trim())
            .map_err(|err| format!("expected JSON output, got '{}': {err}", self.stdout))
    }
}

impl CliHarness {
    pub fn new() -> Result<Self, String> {
        Ok(Self {
            dir: tempfile::tempdir().map_err(|e| e.to_string())?,
            binary_path: PathBuf::from(assert_cmd::cargo::cargo_bin!("swarm")),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> Result<PathBuf, String> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).map_err(|e| e.to_string())?;
        Ok(path)
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.binary_path);
        command
            .current_dir(self.dir.path())
            .env_remove("SWARM_DB_PATH")
            .env_remove("SWARM_MAX_WORKERS")
            .env_remove("SWARM_MAX_INVOCATIONS")
            .env("RUST_LOG", "warn")
            .arg("--database")
            .arg(self.dir.path().join("swarm.db"));
        command
    }

    pub fn run(&self, args: &[&str]) -> Result<CliRun, String> {
        let output = self.command().args(args).output().map_err(|e| e.to_string())?;
        Ok(CliRun {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        })
    }
}

pub const THREE_TASK_PLAN: &str = r#"[
  {"task_key": "T1", "phase": 1, "test_file": "tests/test_t1.py", "impl_file": "src/t1.py"},
  {"task_key": "T2", "phase": 1, "test_file": "tests/test_t2.py", "impl_file": "src/t2.py"},
  {"task_key": "T3", "phase": 2, "depends_on": ["T1"], "test_file": "tests/test_t3.py", "impl_file": "src/t3.py"}
]"#;
