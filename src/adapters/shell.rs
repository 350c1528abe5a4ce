use crate::error::{Result, SwarmError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

pub const MAX_OUTPUT_CAPTURE_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub timed_out: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl ShellOptions {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            workdir: None,
            timeout,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Values substituted into command templates. Every value is shell-escaped.
#[derive(Debug, Clone, Default)]
pub struct CommandVars<'a> {
    pub task_key: &'a str,
    pub test_file: &'a str,
    pub impl_file: &'a str,
    pub workdir: Option<&'a Path>,
    pub attempt: u32,
    pub test_files: &'a [String],
}

#[must_use]
pub fn render_command(template: &str, vars: &CommandVars<'_>) -> String {
    let workdir = vars
        .workdir
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let test_files = vars
        .test_files
        .iter()
        .map(|f| shell_escape(f))
        .collect::<Vec<_>>()
        .join(" ");

    template
        .replace("{task_key}", &shell_escape(vars.task_key))
        .replace("{test_files}", &test_files)
        .replace("{test_file}", &shell_escape(vars.test_file))
        .replace("{impl_file}", &shell_escape(vars.impl_file))
        .replace("{workdir}", &shell_escape(&workdir))
        .replace("{attempt}", &vars.attempt.to_string())
}

fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Runs `command` under `bash -lc`. The child is killed if the deadline passes
/// or the returned future is dropped.
///
/// # Errors
/// Returns `CollaboratorError` when the process cannot be spawned.
pub async fn run_shell_command(command: &str, options: &ShellOptions) -> Result<CommandOutput> {
    let mut cmd = Command::new("bash");
    cmd.arg("-lc")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(workdir) = &options.workdir {
        cmd.current_dir(workdir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    run_child(cmd, command, options.timeout).await
}

/// Same contract as [`run_shell_command`] for a program with explicit args.
///
/// # Errors
/// Returns `CollaboratorError` when the process cannot be spawned.
pub async fn run_program(
    program: &str,
    args: &[&str],
    workdir: &Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    run_program_with_env(program, args, workdir, &[], timeout).await
}

/// [`run_program`] with extra environment variables for the child.
///
/// # Errors
/// Returns `CollaboratorError` when the process cannot be spawned.
pub async fn run_program_with_env(
    program: &str,
    args: &[&str],
    workdir: &Path,
    env: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    run_child(cmd, &format!("{program} {}", args.join(" ")), timeout).await
}

async fn run_child(mut cmd: Command, label: &str, timeout: Duration) -> Result<CommandOutput> {
    let mut child = cmd
        .spawn()
        .map_err(|e| SwarmError::CollaboratorError(format!("Failed to spawn `{label}`: {e}")))?;

    let stdout = child.stdout.take().ok_or_else(|| {
        SwarmError::CollaboratorError(format!("Failed to capture stdout of `{label}`"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        SwarmError::CollaboratorError(format!("Failed to capture stderr of `{label}`"))
    })?;

    let stdout_task =
        tokio::spawn(async move { capture_stream_limited(stdout, MAX_OUTPUT_CAPTURE_BYTES).await });
    let stderr_task =
        tokio::spawn(async move { capture_stream_limited(stderr, MAX_OUTPUT_CAPTURE_BYTES).await });

    let Ok(status) = tokio::time::timeout(timeout, child.wait()).await else {
        let _ = child.kill().await;
        stdout_task.abort();
        stderr_task.abort();
        return Ok(CommandOutput {
            success: false,
            timed_out: true,
            message: format!("`{label}` timed out after {}s", timeout.as_secs()),
        });
    };
    let status = status.map_err(SwarmError::IoError)?;

    let stdout = join_capture(stdout_task).await?;
    let stderr = join_capture(stderr_task).await?;
    let message = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, _) => stderr,
        (_, true) => stdout,
        _ => format!("{stdout}\n{stderr}"),
    };

    Ok(CommandOutput {
        success: status.success(),
        timed_out: false,
        message,
    })
}

async fn join_capture(task: tokio::task::JoinHandle<Result<StreamCapture>>) -> Result<String> {
    let capture = task
        .await
        .map_err(|e| SwarmError::Internal(format!("Output capture task failed: {e}")))??;
    let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
    if capture.truncated {
        text.push_str("\n[output truncated]");
    }
    Ok(text)
}

#[derive(Debug, Clone)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

pub async fn capture_stream_limited<R>(mut stream: R, max_bytes: usize) -> Result<StreamCapture>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut chunk = [0_u8; 8_192];

    loop {
        let read = stream.read(&mut chunk).await.map_err(SwarmError::IoError)?;
        if read == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(bytes.len());
        let to_copy = remaining.min(read);
        bytes.extend_from_slice(&chunk[..to_copy]);
        truncated |= to_copy < read;
    }

    Ok(StreamCapture { bytes, truncated })
}
