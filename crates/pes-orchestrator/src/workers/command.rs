//! External collaborator commands shared by the builtin workers
//!
//! A command gets the iteration context and the incoming message as one
//! JSON document on stdin, plus `PES_*` environment variables naming the
//! files it should read and write. Each command runs in its own process
//! group, which is killed once the command returns, fails or is dropped.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use pes_core::{Context, IterationWorkspace, Message, PesError, Phase, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

/// Longest excerpt of command output quoted in an error
const OUTPUT_EXCERPT_CHARS: usize = 4000;

/// How long to wait for pipes to close after the group is killed
const PIPE_DRAIN: Duration = Duration::from_secs(1);

fn default_timeout_secs() -> u64 {
    600
}

/// `command`, `timeout_secs` and `env` keys of a worker section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program followed by its arguments; empty means "not configured"
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_timeout_secs(),
            env: BTreeMap::new(),
        }
    }
}

impl CommandSpec {
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Document written to the command's stdin
#[derive(Serialize)]
struct CommandInput<'a> {
    context: &'a Context,
    message: &'a Message,
}

/// Captured result of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Parse a worker section, treating `Null` as all defaults
pub(crate) fn parse_section<T>(phase: Phase, name: &str, value: &serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| PesError::Config(format!("Invalid [workers.{}] for {}: {}", name, phase, e)))
}

/// Variables every builtin command receives
pub(crate) fn base_env(context: &Context, workspace: &IterationWorkspace) -> Vec<(String, String)> {
    vec![
        ("PES_TASK".into(), context.task.clone()),
        ("PES_TRACE_ID".into(), context.trace_id.clone()),
        ("PES_ITERATION".into(), context.current_iteration.to_string()),
        ("PES_ISLAND".into(), context.island_id.to_string()),
        (
            "PES_WORKSPACE".into(),
            workspace.root().to_string_lossy().into_owned(),
        ),
        (
            "PES_PARENT_INFO_PATH".into(),
            workspace.parent_info_path().to_string_lossy().into_owned(),
        ),
    ]
}

/// SIGKILLs the command's process group when dropped
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id().map(|pid| Pid::from_raw(pid as i32)))
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(group) = self.0.take() else {
            return;
        };
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => debug!("Killed processes left in command group {}", group),
            Err(Errno::ESRCH) => {}
            Err(e) => debug!("SIGKILL to command group {} failed: {}", group, e),
        }
    }
}

fn read_pipe<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes).await;
        }
        bytes
    })
}

async fn drain(reader: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN, reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &text[..end])
}

/// Run `spec` in `cwd`, failing the phase on spawn error, timeout or non-zero exit
pub(crate) async fn run_command(
    phase: Phase,
    spec: &CommandSpec,
    cwd: &Path,
    env: &[(String, String)],
    context: &Context,
    message: &Message,
) -> Result<CommandOutput> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| PesError::Config(format!("{} command is empty", phase)))?;

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(&spec.env)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
        .map_err(|e| PesError::worker(phase, format!("Failed to run {}: {}", program, e)))?;
    let group = ProcessGroup::of(&child);

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&CommandInput { context, message })?;
        // Commands that ignore stdin close it early; that is not an error
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = read_pipe(child.stdout.take());
    let stderr = read_pipe(child.stderr.take());

    let status = tokio::time::timeout(Duration::from_secs(spec.timeout_secs), child.wait())
        .await
        .map_err(|_| {
            PesError::worker(
                phase,
                format!("{} timed out after {}s", spec.display(), spec.timeout_secs),
            )
        })?
        .map_err(|e| PesError::worker(phase, format!("Waiting on {} failed: {}", program, e)))?;

    // Anything the command left running would keep the pipes open
    drop(group);
    let stdout = drain(stdout).await;
    let stderr = drain(stderr).await;
    if !status.success() {
        return Err(PesError::worker(
            phase,
            format!(
                "{} failed with {}:\n\nSTDOUT:\n{}\n\nSTDERR:\n{}",
                spec.display(),
                status,
                truncate(stdout.trim(), OUTPUT_EXCERPT_CHARS),
                truncate(stderr.trim(), OUTPUT_EXCERPT_CHARS)
            ),
        ));
    }

    let duration = started.elapsed();
    debug!("{} command finished in {:?}", phase, duration);
    Ok(CommandOutput {
        stdout,
        stderr,
        duration,
    })
}
