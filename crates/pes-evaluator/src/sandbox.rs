//! Child-process evaluator
//!
//! Each evaluation gets a directory under `workspace_path` holding the
//! evaluation script and the candidate file. The script runs as
//! `<program> <args..> <script> <candidate>` in its own process group.
//! A supervisor task owns the child handle, so the child is terminated and
//! reaped even if the caller drops the `evaluate` future.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use pes_core::{EvaluationResult, EvaluatorConfig, PesError, Result, ShutdownToken};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::evaluator::{Candidate, CandidateSource, Evaluator};
use crate::payload::{parse_evaluation, tail};

/// Longest stderr excerpt copied into a failure summary
const STDERR_EXCERPT_CHARS: usize = 2000;

/// How the supervised child ended
#[derive(Debug)]
enum ChildExit {
    Completed(ExitStatus),
    TimedOut,
    Interrupted,
    WaitFailed(std::io::Error),
}

/// Captured output of one pipe
#[derive(Debug, Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Bytes read from a pipe so far, shared with the reader task
#[derive(Debug, Default)]
struct PipeBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

/// A pipe reader whose partial output survives an abort
struct Capture {
    reader: JoinHandle<()>,
    buffer: Arc<Mutex<PipeBuffer>>,
}

/// Decrements the in-flight counter when the supervisor finishes
struct InFlightGuard {
    counter: Arc<watch::Sender<usize>>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Runs evaluation code in a sandboxed child process
pub struct SandboxEvaluator {
    config: EvaluatorConfig,
    script: String,
    shutdown: ShutdownToken,
    interrupts: watch::Sender<u64>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl SandboxEvaluator {
    /// Resolve the evaluation code once; a missing script is a config error
    pub fn new(config: EvaluatorConfig, shutdown: ShutdownToken) -> Result<Self> {
        let script = config.evaluate_source()?;
        if config.program.trim().is_empty() {
            return Err(PesError::Config("evaluator.program must not be empty".into()));
        }
        let (interrupts, _) = watch::channel(0u64);
        let (in_flight, _) = watch::channel(0usize);
        Ok(Self {
            config,
            script,
            shutdown,
            interrupts,
            in_flight: Arc::new(in_flight),
        })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Evaluations currently supervised
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    async fn prepare(&self, candidate: &Candidate) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let dir = self.config.workspace_path.join(format!(
            "{}-{}",
            sanitize(&candidate.label),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&dir).await?;
        // The child runs inside `dir`, so hand it absolute paths
        let dir = tokio::fs::canonicalize(&dir).await?;

        let script_path = dir.join(&self.config.script_file_name);
        tokio::fs::write(&script_path, &self.script).await?;

        let solution_path = dir.join(&self.config.solution_file_name);
        match &candidate.source {
            CandidateSource::Inline(content) => {
                tokio::fs::write(&solution_path, content).await?;
            }
            CandidateSource::File(path) => {
                tokio::fs::copy(path, &solution_path).await.map_err(|e| {
                    PesError::Framework(format!("Cannot copy candidate {:?}: {}", path, e))
                })?;
            }
        }
        Ok((dir, script_path, solution_path))
    }

    fn command(&self, dir: &Path, script: &Path, solution: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(script)
            .arg(solution)
            .current_dir(dir)
            .envs(&self.config.env)
            .env("PES_EVAL_DIR", dir)
            .env("PES_SOLUTION_PATH", solution)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }

    async fn run(&self, candidate: &Candidate, timeout: Duration) -> Result<EvaluationResult> {
        let (dir, script, solution) = self.prepare(candidate).await?;
        let mut child = self
            .command(&dir, &script, &solution)
            .spawn()
            .map_err(|e| {
                PesError::Framework(format!(
                    "Failed to spawn evaluator '{}': {}",
                    self.config.program, e
                ))
            })?;
        let pid = child.id();
        debug!(
            "Evaluating {} in {:?} (pid {:?}, timeout {:?})",
            candidate.label, dir, pid, timeout
        );

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|pipe| capture(pipe, limit));
        let stderr = child.stderr.take().map(|pipe| capture(pipe, limit));

        let guard = InFlightGuard::enter(&self.in_flight);
        let supervisor = tokio::spawn(supervise(
            child,
            timeout,
            self.config.grace_period(),
            self.interrupts.subscribe(),
            self.shutdown.clone(),
            guard,
        ));

        let started = Instant::now();
        let exit = supervisor
            .await
            .map_err(|e| PesError::Framework(format!("Evaluation supervisor failed: {}", e)))?;
        let elapsed = started.elapsed();

        // A grandchild can hold the pipes open after the group leader exits
        let drain = self.config.grace_period().max(Duration::from_millis(100));
        let stdout = collect(stdout, drain).await;
        let stderr = collect(stderr, drain).await;

        let result = match exit {
            ChildExit::Completed(status) if status.success() => parse_evaluation(&stdout.text),
            ChildExit::Completed(status) => EvaluationResult::execution_failed(format!(
                "Evaluator exited with {}: {}",
                status,
                tail(&stderr.text, STDERR_EXCERPT_CHARS)
            ))
            .with_metric("exit_code", status.code().map_or(-1, i64::from)),
            ChildExit::TimedOut => EvaluationResult::execution_failed(format!(
                "Evaluation timed out after {:.1}s",
                timeout.as_secs_f64()
            )),
            ChildExit::Interrupted => {
                EvaluationResult::execution_failed("Evaluation interrupted by shutdown request")
            }
            ChildExit::WaitFailed(e) => {
                return Err(PesError::Framework(format!("Waiting on evaluator failed: {}", e)))
            }
        };

        let mut result = result
            .with_metric("runtime_ms", elapsed.as_millis() as u64)
            .with_artifact("eval_dir", dir.to_string_lossy().to_string());
        if !stderr.text.trim().is_empty() {
            result = result.with_artifact("stderr", tail(&stderr.text, STDERR_EXCERPT_CHARS));
        }
        if stdout.truncated || stderr.truncated {
            result = result.with_artifact("output_truncated", true);
        }
        Ok(result)
    }
}

#[async_trait]
impl Evaluator for SandboxEvaluator {
    async fn evaluate(&self, candidate: &Candidate, timeout: Duration) -> EvaluationResult {
        if self.shutdown.is_cancelled() {
            return EvaluationResult::execution_failed("Evaluation skipped: shutdown requested");
        }
        match self.run(candidate, timeout).await {
            Ok(result) => {
                info!(
                    "Evaluated {}: {:?} score={:.4}",
                    candidate.label, result.status, result.score
                );
                result
            }
            Err(e) => {
                warn!("Evaluation harness error for {}: {}", candidate.label, e);
                EvaluationResult::framework_error(e.to_string())
            }
        }
    }

    async fn interrupt(&self) {
        self.interrupts.send_modify(|generation| *generation += 1);
        let mut in_flight = self.in_flight.subscribe();
        if *in_flight.borrow_and_update() == 0 {
            return;
        }
        info!("Interrupting {} in-flight evaluation(s)", *in_flight.borrow());
        // Supervisors escalate to SIGKILL after the grace period, so this ends
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }
}

/// Own the child until it exits, times out or is interrupted, then reap it
async fn supervise(
    mut child: Child,
    timeout: Duration,
    grace: Duration,
    mut interrupts: watch::Receiver<u64>,
    shutdown: ShutdownToken,
    _guard: InFlightGuard,
) -> ChildExit {
    let pid = child.id();

    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ChildExit::Completed(status),
            Err(e) => ChildExit::WaitFailed(e),
        },
        _ = tokio::time::sleep(timeout) => ChildExit::TimedOut,
        Ok(()) = interrupts.changed() => ChildExit::Interrupted,
        _ = shutdown.cancelled() => ChildExit::Interrupted,
    };

    if !matches!(exit, ChildExit::Completed(_)) {
        terminate(&mut child, pid, grace).await;
    }
    // The leader is reaped, but processes it spawned may still hold the group
    release_group(pid, grace).await;
    exit
}

/// SIGTERM the process group, SIGKILL after `grace`, always reap
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let Some(pid) = pid else {
        let _ = child.wait().await;
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", group, e);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        debug!("Evaluator {} exited after SIGTERM", group);
        return;
    }

    warn!(
        "Evaluator {} ignored SIGTERM for {:?}, sending SIGKILL",
        group, grace
    );
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        debug!("SIGKILL to process group {} failed: {}", group, e);
        let _ = child.start_kill();
    }
    if let Err(e) = child.wait().await {
        warn!("Reaping evaluator {} failed: {}", group, e);
    }
}

/// SIGTERM whatever is left in the process group, SIGKILL after `grace`
async fn release_group(pid: Option<u32>, grace: Duration) {
    let Some(pid) = pid else {
        return;
    };
    let group = Pid::from_raw(pid as i32);

    match killpg(group, Signal::SIGTERM) {
        Err(Errno::ESRCH) => return,
        Err(e) => {
            debug!("SIGTERM to process group {} failed: {}", group, e);
            return;
        }
        Ok(()) => debug!("Evaluator {} left processes behind, terminating them", group),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if killpg(group, None) == Err(Errno::ESRCH) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    warn!("Process group {} survived SIGTERM for {:?}, sending SIGKILL", group, grace);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("SIGKILL to process group {} failed: {}", group, e),
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes
fn capture<R>(mut pipe: R, limit: usize) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(PipeBuffer::default()));
    let shared = Arc::clone(&buffer);
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut kept = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    let room = limit.saturating_sub(kept.bytes.len());
                    if n > room {
                        kept.truncated = true;
                    }
                    kept.bytes.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
    });
    Capture { reader, buffer }
}

/// Wait up to `wait` for EOF; on timeout keep what was read so far
async fn collect(capture: Option<Capture>, wait: Duration) -> Captured {
    let Some(Capture { mut reader, buffer }) = capture else {
        return Captured::default();
    };
    let finished = match tokio::time::timeout(wait, &mut reader).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Output reader failed: {}", e);
            true
        }
        Err(_) => {
            reader.abort();
            false
        }
    };
    let kept = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    Captured {
        text: String::from_utf8_lossy(&kept.bytes).into_owned(),
        truncated: kept.truncated || !finished,
    }
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "candidate".to_string()
    } else {
        cleaned
    }
}
