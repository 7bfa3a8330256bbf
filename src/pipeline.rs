//! Sequential phase dispatcher.
//!
//! `PipelineController` walks the plan phase by phase and step by step,
//! feeding live output to the display surface and step results to the report
//! sink. A phase fails only when a step fails to run at all (tool missing,
//! timed out, or cancelled); a tool that runs and exits non-zero is recorded
//! as-is and never stops the pipeline. Reporting failures are logged and
//! tolerated, never fatal to the run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::errors::{ExecutorError, ReportError};
use crate::executor::{
    CommandExecutor, CommandInvocation, ExecMode, ExecutionResult, LineObserver, Outcome,
};
use crate::phase::{Phase, PhaseState, StepSpec};
use crate::tracker::{Severity, StreamKind};
use crate::ui::UiSurface;

/// Receives report events as the pipeline produces them.
///
/// Implementations must not assume the run succeeds; events arrive in
/// dispatch order and stop after an abort.
pub trait ReportSink: Send + Sync {
    fn on_phase_start(&self, phase: &Phase) -> Result<(), ReportError>;
    /// Fires when a step is dispatched, before any output exists.
    fn on_step_start(
        &self,
        phase: &Phase,
        step: &StepSpec,
        invocation: &CommandInvocation,
    ) -> Result<(), ReportError>;
    fn on_step_result(
        &self,
        phase: &Phase,
        step: &StepSpec,
        result: &ExecutionResult,
    ) -> Result<(), ReportError>;
    fn on_phase_end(&self, phase: &Phase, state: PhaseState) -> Result<(), ReportError>;
}

/// Final disposition of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase completed.
    Success,
    /// At least one phase failed but the run went to the end.
    Partial,
    /// The run stopped before reaching the last phase.
    Aborted,
}

impl RunOutcome {
    /// Process exit code reported to the shell.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 2,
            RunOutcome::Aborted => 1,
        }
    }
}

/// One executed step, as recorded in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub label: String,
    pub command: String,
    pub exit_code: i32,
    pub outcome: Outcome,
    pub duration: Duration,
}

impl StepReport {
    fn from_result(step: &StepSpec, result: &ExecutionResult) -> Self {
        Self {
            label: step.label.clone(),
            command: result.command.clone(),
            exit_code: result.exit_code,
            outcome: result.outcome,
            duration: result.duration,
        }
    }
}

/// Per-phase record in the run summary. Phases the run never reached stay
/// `Pending` with no steps.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub state: PhaseState,
    pub steps: Vec<StepReport>,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub target: String,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseReport>,
}

pub struct PipelineController {
    executor: Arc<CommandExecutor>,
    surface: Arc<dyn UiSurface>,
    /// When false, the first failed step aborts the run.
    continue_on_error: bool,
    /// Fallback per-step timeout for steps that do not set their own.
    default_timeout_secs: Option<u64>,
}

impl PipelineController {
    pub fn new(
        executor: Arc<CommandExecutor>,
        surface: Arc<dyn UiSurface>,
        continue_on_error: bool,
        default_timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            executor,
            surface,
            continue_on_error,
            default_timeout_secs,
        }
    }

    /// Run every phase in order against `target`, with `workspace` as the
    /// working directory for all steps.
    pub async fn run_pipeline(
        &self,
        target: &str,
        workspace: &Path,
        phases: &[Phase],
        sink: &dyn ReportSink,
    ) -> Result<PipelineResult> {
        let total_steps: usize = phases.iter().map(|p| p.steps.len()).sum();
        let mut completed = 0usize;
        let mut reports: Vec<PhaseReport> = Vec::with_capacity(phases.len());
        let mut abort_after: Option<usize> = None;

        for (index, phase) in phases.iter().enumerate() {
            info!(phase = %phase.name, steps = phase.steps.len(), "phase starting");
            self.surface.update_status(
                &format!("Starting {}", phase.name),
                Severity::Info,
                Some(&phase.name),
                percent(completed, total_steps),
            );
            report_or_warn(sink.on_phase_start(phase));

            let mut report = PhaseReport {
                name: phase.name.clone(),
                state: PhaseState::Running,
                steps: Vec::with_capacity(phase.steps.len()),
            };
            let mut fatal = false;
            let mut stopped_early = false;

            for step in &phase.steps {
                let mut invocation = step.resolve(target, workspace);
                if invocation.timeout_secs.is_none() {
                    invocation.timeout_secs = self.default_timeout_secs;
                }

                self.surface.update_status(
                    &format!("Running: {}", step.label),
                    Severity::Info,
                    Some(&phase.name),
                    percent(completed, total_steps),
                );
                report_or_warn(sink.on_step_start(phase, step, &invocation));

                // At most one invocation is ever in flight. Async steps go
                // through the detached execution path but their result is
                // still collected before the next step is dispatched.
                let raw = match step.mode {
                    ExecMode::Sync => {
                        self.executor
                            .run_observed(&invocation, Some(self.line_observer()))
                            .await
                    }
                    ExecMode::Async => {
                        let (tx, rx) = oneshot::channel();
                        let handle = Arc::clone(&self.executor).run_async(
                            invocation.clone(),
                            Some(self.line_observer()),
                            Box::new(move |result| {
                                let _ = tx.send(result);
                            }),
                        );
                        let raw = rx.await.map_err(|_| {
                            anyhow::anyhow!(
                                "async step '{}' finished without reporting a result",
                                step.label
                            )
                        })?;
                        let _ = handle.await;
                        raw
                    }
                };
                let result = normalize_result(raw, &invocation.command)?;
                completed += 1;
                let step_fatal =
                    self.record_step(phase, step, &result, sink, &mut report, completed, total_steps);
                fatal |= step_fatal;
                // Cancellation always stops the run; other failures only
                // stop it when the policy says so.
                if result.outcome == Outcome::Cancelled
                    || (step_fatal && !self.continue_on_error)
                {
                    stopped_early = true;
                    break;
                }
            }

            report.state = if fatal {
                PhaseState::Failed
            } else {
                PhaseState::Complete
            };
            report_or_warn(sink.on_phase_end(phase, report.state));

            let (text, severity) = if fatal {
                (format!("{} failed", phase.name), Severity::Error)
            } else {
                (format!("{} complete", phase.name), Severity::Success)
            };
            self.surface.update_status(
                &text,
                severity,
                Some(&phase.name),
                percent(completed, total_steps),
            );
            info!(phase = %phase.name, state = ?report.state, "phase finished");
            reports.push(report);

            if stopped_early || (fatal && !self.continue_on_error) {
                abort_after = Some(index);
                break;
            }
        }

        if let Some(index) = abort_after {
            for skipped in &phases[index + 1..] {
                reports.push(PhaseReport {
                    name: skipped.name.clone(),
                    state: PhaseState::Pending,
                    steps: Vec::new(),
                });
            }
        }

        let outcome = if abort_after.is_some() {
            RunOutcome::Aborted
        } else if reports.iter().any(|r| r.state == PhaseState::Failed) {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        };

        let (text, severity) = match outcome {
            RunOutcome::Success => ("Run complete".to_string(), Severity::Success),
            RunOutcome::Partial => ("Run complete with failures".to_string(), Severity::Warning),
            RunOutcome::Aborted => ("Run aborted".to_string(), Severity::Error),
        };
        self.surface
            .update_status(&text, severity, None, percent(completed, total_steps));

        Ok(PipelineResult {
            target: target.to_string(),
            outcome,
            phases: reports,
        })
    }

    /// Record one finished step everywhere it needs to go. Returns whether
    /// the step counts as fatal for its phase.
    #[allow(clippy::too_many_arguments)]
    fn record_step(
        &self,
        phase: &Phase,
        step: &StepSpec,
        result: &ExecutionResult,
        sink: &dyn ReportSink,
        report: &mut PhaseReport,
        completed: usize,
        total_steps: usize,
    ) -> bool {
        report.steps.push(StepReport::from_result(step, result));
        report_or_warn(sink.on_step_result(phase, step, result));

        let (text, severity) = match result.outcome {
            Outcome::Completed if result.exit_code == 0 => (
                format!("{} finished", step.label),
                Severity::Success,
            ),
            Outcome::Completed => (
                format!("{} finished (exit {})", step.label, result.exit_code),
                Severity::Warning,
            ),
            Outcome::ToolNotFound => (
                format!("{} failed: tool not found", step.label),
                Severity::Error,
            ),
            Outcome::Timeout => (format!("{} timed out", step.label), Severity::Error),
            Outcome::Cancelled => (format!("{} cancelled", step.label), Severity::Warning),
        };
        self.surface.update_status(
            &text,
            severity,
            Some(&phase.name),
            percent(completed, total_steps),
        );

        if result.is_fatal() {
            warn!(
                step = %step.label,
                outcome = ?result.outcome,
                exit_code = result.exit_code,
                "step failed"
            );
        }
        result.is_fatal()
    }

    fn line_observer(&self) -> LineObserver {
        let surface = Arc::clone(&self.surface);
        Arc::new(move |line: &str, stream: StreamKind, _seq: u64| {
            surface.append_output(line, stream);
        })
    }
}

/// A spawn failure for a missing binary is the same condition as shell exit
/// 127; fold it into the result instead of failing the run.
fn normalize_result(
    raw: Result<ExecutionResult, ExecutorError>,
    command: &str,
) -> Result<ExecutionResult> {
    match raw {
        Ok(result) => Ok(result),
        Err(ExecutorError::SpawnFailed { command, source })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(ExecutionResult {
                command,
                stdout: String::new(),
                stderr: format!("{source}"),
                exit_code: 127,
                started_at: Utc::now(),
                duration: Duration::ZERO,
                outcome: Outcome::ToolNotFound,
            })
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to execute: {command}"))),
    }
}

fn report_or_warn(result: Result<(), ReportError>) {
    if let Err(e) = result {
        warn!("report sink error (continuing): {e}");
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    ((completed * 100) / total.max(1)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UiError;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct QuietSurface;

    impl UiSurface for QuietSurface {
        fn start(&self) -> Result<(), UiError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), UiError> {
            Ok(())
        }
        fn update_status(&self, _: &str, _: Severity, _: Option<&str>, _: u8) {}
        fn append_output(&self, _: &str, _: StreamKind) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ReportSink for RecordingSink {
        fn on_phase_start(&self, phase: &Phase) -> Result<(), ReportError> {
            self.events.lock().unwrap().push(format!("start:{}", phase.name));
            Ok(())
        }
        fn on_step_start(
            &self,
            _phase: &Phase,
            step: &StepSpec,
            _invocation: &CommandInvocation,
        ) -> Result<(), ReportError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("dispatch:{}", step.label));
            Ok(())
        }
        fn on_step_result(
            &self,
            _phase: &Phase,
            step: &StepSpec,
            result: &ExecutionResult,
        ) -> Result<(), ReportError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("step:{}:{:?}", step.label, result.outcome));
            Ok(())
        }
        fn on_phase_end(&self, phase: &Phase, state: PhaseState) -> Result<(), ReportError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("end:{}:{:?}", phase.name, state));
            Ok(())
        }
    }

    /// Sink whose every call fails, to prove reporting is non-fatal.
    struct BrokenSink;

    impl ReportSink for BrokenSink {
        fn on_phase_start(&self, _: &Phase) -> Result<(), ReportError> {
            Err(ReportError::Io {
                path: "/nonexistent".into(),
                source: std::io::Error::other("disk gone"),
            })
        }
        fn on_step_start(
            &self,
            _: &Phase,
            _: &StepSpec,
            _: &CommandInvocation,
        ) -> Result<(), ReportError> {
            Err(ReportError::Io {
                path: "/nonexistent".into(),
                source: std::io::Error::other("disk gone"),
            })
        }
        fn on_step_result(
            &self,
            _: &Phase,
            _: &StepSpec,
            _: &ExecutionResult,
        ) -> Result<(), ReportError> {
            Err(ReportError::Io {
                path: "/nonexistent".into(),
                source: std::io::Error::other("disk gone"),
            })
        }
        fn on_phase_end(&self, _: &Phase, _: PhaseState) -> Result<(), ReportError> {
            Err(ReportError::Io {
                path: "/nonexistent".into(),
                source: std::io::Error::other("disk gone"),
            })
        }
    }

    fn controller(continue_on_error: bool) -> PipelineController {
        PipelineController::new(
            Arc::new(CommandExecutor::default()),
            Arc::new(QuietSurface),
            continue_on_error,
            None,
        )
    }

    fn echo_phases() -> Vec<Phase> {
        vec![
            Phase::new(
                "Reconnaissance",
                vec![
                    StepSpec::new("greet", "echo hello {target}"),
                    StepSpec::new("count", "echo 1 && echo 2"),
                ],
            ),
            Phase::new("Scanning", vec![StepSpec::new("probe", "echo scan")]),
        ]
    }

    #[tokio::test]
    async fn test_all_steps_succeed_yields_success() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();

        let result = controller(true)
            .run_pipeline("example.com", dir.path(), &echo_phases(), &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.outcome.exit_code(), 0);
        assert_eq!(result.phases.len(), 2);
        assert!(result.phases.iter().all(|p| p.state == PhaseState::Complete));
        assert_eq!(result.phases[0].steps.len(), 2);

        let events = sink.events();
        assert_eq!(events.first().map(String::as_str), Some("start:Reconnaissance"));
        assert!(events.contains(&"end:Scanning:Complete".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_tool_exit_does_not_fail_phase() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();
        let phases = vec![Phase::new(
            "Scanning",
            vec![
                StepSpec::new("flaky", "exit 4"),
                StepSpec::new("after", "echo still-here"),
            ],
        )];

        let result = controller(true)
            .run_pipeline("example.com", dir.path(), &phases, &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.phases[0].state, PhaseState::Complete);
        assert_eq!(result.phases[0].steps[0].exit_code, 4);
        assert_eq!(result.phases[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_tool_with_continue_on_error_yields_partial() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();
        let phases = vec![
            Phase::new(
                "Reconnaissance",
                vec![StepSpec::new("broken", "tool-that-is-not-installed-xyz")],
            ),
            Phase::new("Scanning", vec![StepSpec::new("probe", "echo scan")]),
        ];

        let result = controller(true)
            .run_pipeline("example.com", dir.path(), &phases, &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Partial);
        assert_eq!(result.outcome.exit_code(), 2);
        assert_eq!(result.phases[0].state, PhaseState::Failed);
        assert_eq!(result.phases[0].steps[0].outcome, Outcome::ToolNotFound);
        // The later phase still ran to completion.
        assert_eq!(result.phases[1].state, PhaseState::Complete);
        assert!(sink.events().contains(&"end:Scanning:Complete".to_string()));
    }

    #[tokio::test]
    async fn test_missing_tool_without_continue_on_error_aborts() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();
        let phases = vec![
            Phase::new(
                "Reconnaissance",
                vec![
                    StepSpec::new("broken", "tool-that-is-not-installed-xyz"),
                    StepSpec::new("never-runs", "echo unreachable"),
                ],
            ),
            Phase::new("Scanning", vec![StepSpec::new("probe", "echo scan")]),
        ];

        let result = controller(false)
            .run_pipeline("example.com", dir.path(), &phases, &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.outcome.exit_code(), 1);
        assert_eq!(result.phases[0].state, PhaseState::Failed);
        // The first fatal step stops the phase; the rest never dispatch.
        assert_eq!(result.phases[0].steps.len(), 1);
        assert_eq!(result.phases[1].state, PhaseState::Pending);
        assert!(result.phases[1].steps.is_empty());
        assert!(!sink.events().contains(&"start:Scanning".to_string()));
    }

    #[tokio::test]
    async fn test_async_step_result_collected_before_next_dispatch() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();
        let phases = vec![Phase::new(
            "Scanning",
            vec![
                StepSpec::new("slow-scan", "sleep 0.2 && echo swept").asynchronous(),
                StepSpec::new("quick", "echo quick"),
            ],
        )];

        let result = controller(true)
            .run_pipeline("example.com", dir.path(), &phases, &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.phases[0].steps.len(), 2);
        assert!(result.phases[0]
            .steps
            .iter()
            .all(|s| s.outcome == Outcome::Completed));
        // Step order is preserved: the detached step finishes before the
        // next one dispatches.
        assert_eq!(result.phases[0].steps[0].label, "slow-scan");

        let events = sink.events();
        let slow_done = events
            .iter()
            .position(|e| e == "step:slow-scan:Completed")
            .unwrap();
        let quick_dispatched = events.iter().position(|e| e == "dispatch:quick").unwrap();
        assert!(slow_done < quick_dispatched);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::default();
        let executor = Arc::new(CommandExecutor::new(Duration::from_millis(200)));
        let controller = PipelineController::new(
            Arc::clone(&executor),
            Arc::new(QuietSurface),
            true,
            None,
        );
        let phases = vec![
            Phase::new("Reconnaissance", vec![StepSpec::new("wait", "sleep 10")]),
            Phase::new("Scanning", vec![StepSpec::new("probe", "echo scan")]),
        ];

        let canceller = Arc::clone(&executor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let result = controller
            .run_pipeline("example.com", dir.path(), &phases, &sink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.phases[0].steps[0].outcome, Outcome::Cancelled);
        assert_eq!(result.phases[1].state, PhaseState::Pending);
    }

    #[tokio::test]
    async fn test_sink_failures_do_not_fail_the_run() {
        let dir = tempdir().unwrap();

        let result = controller(true)
            .run_pipeline("example.com", dir.path(), &echo_phases(), &BrokenSink)
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Success);
    }

    #[test]
    fn test_percent_is_bounded() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(0, 0), 0);
    }
}
