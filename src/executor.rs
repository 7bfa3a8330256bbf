//! Command execution engine.
//!
//! This module handles running one external tool invocation:
//! - `run` / `run_observed`: await the process, capture full output, classify
//!   the outcome
//! - `run_async`: spawn the invocation on its own task and report completion
//!   through a callback
//!
//! Commands go through `sh -c` so pipelines and redirections in the command
//! templates work unchanged. A missing executable is therefore reported by the
//! shell as exit 127 and classified as [`Outcome::ToolNotFound`]; it is data
//! in the result, never an error. Timeouts and cancellation terminate the
//! process with an escalating SIGTERM-then-SIGKILL sequence.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecutorError;
use crate::tracker::StreamKind;

/// Exit code `sh` reports when the command was not found.
const SHELL_EXIT_NOT_FOUND: i32 = 127;

/// Synthetic exit code recorded when the process died to a signal.
const EXIT_CODE_SIGNALLED: i32 = -1;

/// How an invocation is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// The caller awaits the full result.
    #[default]
    Sync,
    /// The invocation runs on its own task; completion arrives out-of-band.
    Async,
}

/// Classification of a finished invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The process ran to completion on its own; the exit code is the tool's.
    Completed,
    /// The shell could not find the executable (exit 127).
    ToolNotFound,
    /// The configured timeout elapsed and the process was terminated.
    Timeout,
    /// An explicit stop request terminated the process.
    Cancelled,
}

/// One request to execute an external command. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Full shell command text, run via `sh -c`.
    pub command: String,
    /// Working directory for the process.
    pub workdir: PathBuf,
    /// Optional wall-clock limit in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Dispatch mode (defaults to sync).
    #[serde(default)]
    pub mode: ExecMode,
}

impl CommandInvocation {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout_secs: None,
            mode: ExecMode::Sync,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.mode = ExecMode::Async;
        self
    }
}

/// Captured outcome of an invocation. Produced exactly once, immutable after.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// True when the tool ran to completion, whatever its exit code said.
    ///
    /// Exit-code conventions differ per tool; the executor never interprets
    /// them. Only a non-`Completed` classification fails a pipeline step.
    pub fn ran_to_completion(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    /// True when this result should count as a fatal step in a phase.
    pub fn is_fatal(&self) -> bool {
        !self.ran_to_completion()
    }
}

/// Per-line observer for streamed output.
///
/// Called with the line text, the stream it arrived on, and the strictly
/// increasing per-stream sequence number. Within one stream, calls preserve
/// emission order; there is no ordering guarantee across the two streams.
pub type LineObserver = Arc<dyn Fn(&str, StreamKind, u64) + Send + Sync>;

/// Callback fired exactly once when an async invocation terminates.
pub type DoneCallback = Box<dyn FnOnce(Result<ExecutionResult, ExecutorError>) + Send>;

/// Runs external commands, streaming output and classifying outcomes.
pub struct CommandExecutor {
    /// Grace period between SIGTERM and SIGKILL when terminating.
    grace: Duration,
    cancel: CancellationToken,
}

impl CommandExecutor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every in-flight invocation of this executor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request termination of the current invocation (and all future ones).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run an invocation to completion without streaming.
    pub async fn run(&self, invocation: &CommandInvocation) -> Result<ExecutionResult, ExecutorError> {
        self.run_observed(invocation, None).await
    }

    /// Run an invocation to completion, feeding each output line to `observer`
    /// as it becomes available.
    pub async fn run_observed(
        &self,
        invocation: &CommandInvocation,
        observer: Option<LineObserver>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&invocation.command)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The shell leads its own process group so termination reaches every
        // process of a compound command, not just the shell itself. Otherwise
        // orphaned children of a timed-out pipeline keep the output pipes
        // open and the reader tasks never finish.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| ExecutorError::SpawnFailed {
                command: invocation.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ExecutorError::PipeMissing { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ExecutorError::PipeMissing { stream: "stderr" })?;

        let stdout_task = spawn_line_reader(stdout, StreamKind::Stdout, observer.clone());
        let stderr_task = spawn_line_reader(stderr, StreamKind::Stderr, observer);

        let limit = invocation.timeout_secs.map(Duration::from_secs);

        let event = tokio::select! {
            status = child.wait() => WaitEvent::Exited(status),
            _ = self.cancel.cancelled() => WaitEvent::Cancelled,
            _ = sleep_or_forever(limit) => WaitEvent::TimedOut,
        };

        let (status, mut outcome) = match event {
            WaitEvent::Exited(status) => {
                (status.map_err(ExecutorError::WaitFailed)?, Outcome::Completed)
            }
            WaitEvent::Cancelled => (self.terminate(&mut child).await?, Outcome::Cancelled),
            WaitEvent::TimedOut => (self.terminate(&mut child).await?, Outcome::Timeout),
        };

        // The pipes close once the process is gone, so the readers drain and finish.
        let stdout_text = join_reader(stdout_task).await?;
        let stderr_text = join_reader(stderr_task).await?;

        let exit_code = status.code().unwrap_or(EXIT_CODE_SIGNALLED);
        if outcome == Outcome::Completed && exit_code == SHELL_EXIT_NOT_FOUND {
            outcome = Outcome::ToolNotFound;
        }

        Ok(ExecutionResult {
            command: invocation.command.clone(),
            stdout: stdout_text,
            stderr: stderr_text,
            exit_code,
            started_at,
            duration: start.elapsed(),
            outcome,
        })
    }

    /// Start an invocation without blocking the caller.
    ///
    /// `on_done` fires exactly once with the result. The returned handle can
    /// be awaited to join the invocation's task.
    pub fn run_async(
        self: Arc<Self>,
        invocation: CommandInvocation,
        observer: Option<LineObserver>,
        on_done: DoneCallback,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let result = self.run_observed(&invocation, observer).await;
            on_done(result);
        })
    }

    /// Escalating termination: SIGTERM to the process group, wait out the
    /// grace period, then SIGKILL to the group.
    async fn terminate(&self, child: &mut Child) -> Result<std::process::ExitStatus, ExecutorError> {
        signal_group(child, TermSignal::Term);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status.map_err(ExecutorError::WaitFailed),
            Err(_) => {
                signal_group(child, TermSignal::Kill);
                child.kill().await.map_err(ExecutorError::WaitFailed)?;
                child.wait().await.map_err(ExecutorError::WaitFailed)
            }
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Which stage of the termination escalation to deliver.
#[derive(Clone, Copy)]
enum TermSignal {
    Term,
    Kill,
}

/// Signal the child's whole process group. Compound commands leave the shell's
/// descendants in the same group, so this reaches them all and the output
/// pipes actually close.
#[cfg(unix)]
fn signal_group(child: &Child, signal: TermSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let signal = match signal {
            TermSignal::Term => Signal::SIGTERM,
            TermSignal::Kill => Signal::SIGKILL,
        };
        let _ = killpg(Pid::from_raw(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: TermSignal) {}

/// What ended the wait on a running child.
enum WaitEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Sleep for `limit`, or never resolve when no limit is configured.
async fn sleep_or_forever(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Read a child stream line by line, invoking the observer per line and
/// accumulating the full text. Sequence numbers start at 0 and strictly
/// increase within the stream.
fn spawn_line_reader<R>(
    stream: R,
    kind: StreamKind,
    observer: Option<LineObserver>,
) -> JoinHandle<Result<String, std::io::Error>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut captured = String::new();
        let mut seq: u64 = 0;
        while let Some(line) = lines.next_line().await? {
            if let Some(ref obs) = observer {
                obs(&line, kind, seq);
            }
            seq += 1;
            captured.push_str(&line);
            captured.push('\n');
        }
        Ok(captured)
    })
}

async fn join_reader(task: JoinHandle<Result<String, std::io::Error>>) -> Result<String, ExecutorError> {
    task.await
        .map_err(|e| ExecutorError::Other(anyhow!("output reader task failed: {e}")))?
        .map_err(ExecutorError::StreamIo)
}

/// Extract the first IPv4 address from host-like output.
pub fn extract_ip(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(\d{1,3}(?:\.\d{1,3}){3})").expect("IPv4 pattern is a valid static regex")
    });
    re.captures(text).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tempfile::tempdir;

    fn invocation(command: &str, dir: &std::path::Path) -> CommandInvocation {
        CommandInvocation::new(command, dir)
    }

    #[tokio::test]
    async fn test_echo_captures_stdout_and_exit_zero() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let result = executor.run(&invocation("echo hello", dir.path())).await.unwrap();

        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_stderr_is_captured_separately() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let result = executor
            .run(&invocation("echo oops 1>&2", dir.path()))
            .await
            .unwrap();

        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_missing_tool_classifies_tool_not_found() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let result = executor
            .run(&invocation("this-tool-does-not-exist-xyz", dir.path()))
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::ToolNotFound);
        assert_ne!(result.exit_code, 0);
        assert!(result.is_fatal());
    }

    #[tokio::test]
    async fn test_tool_nonzero_exit_recorded_as_is() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let result = executor.run(&invocation("exit 3", dir.path())).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.outcome, Outcome::Completed);
        assert!(!result.is_fatal());
    }

    #[tokio::test]
    async fn test_workdir_is_respected() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let result = executor.run(&invocation("pwd", dir.path())).await.unwrap();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(result.stdout.trim(), expected.to_string_lossy());
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_classifies() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new(Duration::from_millis(500));

        let start = Instant::now();
        let result = executor
            .run(&invocation("sleep 10", dir.path()).with_timeout(1))
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Timeout);
        // Timeout plus the grace period, with a bounded delta.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_on_pipelined_command_returns_within_bound() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new(Duration::from_millis(500));

        // Both sides of the pipe outlive the timeout; group termination has
        // to reach the right-hand process or the stdout pipe stays open and
        // the reader never drains.
        let start = Instant::now();
        let result = executor
            .run(&invocation("sleep 30 | sleep 30", dir.path()).with_timeout(1))
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "termination took {:?}, past timeout plus grace",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_cancellation_classifies_cancelled() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(CommandExecutor::new(Duration::from_millis(500)));
        let inv = invocation("sleep 10", dir.path());

        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move { runner.run(&inv).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        executor.cancel();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert!(result.is_fatal());
    }

    #[tokio::test]
    async fn test_observer_sees_lines_in_order_with_monotone_seq() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::default();

        let seen: Arc<Mutex<Vec<(String, StreamKind, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: LineObserver = Arc::new(move |line, stream, seq| {
            sink.lock().unwrap().push((line.to_string(), stream, seq));
        });

        let result = executor
            .run_observed(
                &invocation("printf 'a\\nb\\nc\\n'", dir.path()),
                Some(observer),
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, "a\nb\nc\n");
        let seen = seen.lock().unwrap();
        let stdout_events: Vec<_> = seen
            .iter()
            .filter(|(_, s, _)| *s == StreamKind::Stdout)
            .collect();
        assert_eq!(stdout_events.len(), 3);
        for (i, (text, _, seq)) in stdout_events.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert_eq!(text, ["a", "b", "c"][i]);
        }
    }

    #[tokio::test]
    async fn test_run_async_does_not_block_caller() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(CommandExecutor::default());

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let exit_code = Arc::new(Mutex::new(None));
        let exit_slot = Arc::clone(&exit_code);

        let handle = executor.run_async(
            invocation("sleep 1 && echo done", dir.path()),
            None,
            Box::new(move |result| {
                *exit_slot.lock().unwrap() = Some(result.unwrap());
                done_flag.store(true, Ordering::SeqCst);
            }),
        );

        // The caller keeps making progress while the command sleeps.
        let ticks = AtomicU64::new(0);
        while !done.load(Ordering::SeqCst) {
            ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) > 10);
        let result = exit_code.lock().unwrap().take().unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "done\n");
    }

    #[test]
    fn test_extract_ip_finds_first_ipv4() {
        let out = "example.com has address 93.184.216.34\nexample.com has address 10.0.0.1";
        assert_eq!(extract_ip(out).as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn test_extract_ip_none_when_absent() {
        assert_eq!(extract_ip(""), None);
        assert_eq!(extract_ip("no addresses here"), None);
    }

    #[test]
    fn test_invocation_builders() {
        let inv = CommandInvocation::new("echo hi", "/tmp")
            .with_timeout(30)
            .asynchronous();
        assert_eq!(inv.timeout_secs, Some(30));
        assert_eq!(inv.mode, ExecMode::Async);
    }
}
