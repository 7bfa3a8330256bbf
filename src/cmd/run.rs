//! Pipeline run wiring for `reconflow run` and `reconflow plan`.
//!
//! `cmd_run` assembles a run from configuration: tool preflight, plan
//! loading, display surface selection (with plain fallback), executor and
//! pipeline construction, and report finalization. It returns the process
//! exit code for the run outcome; hard failures (unwritable output,
//! malformed plan) surface as errors instead.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::Config;
use crate::errors::UiError;
use crate::executor::CommandExecutor;
use crate::phase::{DEFAULT_TOOLS, Phase, PlanFile, default_plan, missing_tools};
use crate::pipeline::{PipelineController, PipelineResult};
use crate::report::ReportWriter;
use crate::tracker::Tracker;
use crate::ui::{PlainSurface, TuiSurface, UiSurface};

/// Run the pipeline described by `config`. Returns the process exit code.
pub async fn cmd_run(config: Config) -> Result<i32> {
    let _log_guard = init_logging(&config)?;

    preflight_tools();

    let phases = load_phases(&config)?;

    let tracker = Arc::new(Tracker::new(config.status_cap, config.output_cap));
    let executor = Arc::new(CommandExecutor::new(Duration::from_secs(config.grace_secs)));

    // Ctrl-C requests cancellation; in-flight steps are terminated and the
    // run winds down with an abort outcome.
    let signal_cancel = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let surface = bring_up_surface(&config, &tracker, &executor)?;

    // Once the surface owns the terminal, every failure must pass through
    // `stop()` first or raw mode and the alternate screen leak.
    let run_result = drive_pipeline(&config, &phases, &executor, &surface).await;

    if let Err(e) = surface.stop() {
        warn!("display surface shutdown error: {e}");
    }
    let result = run_result?;

    print_closing(&config, &result.outcome);
    Ok(result.outcome.exit_code())
}

/// The fallible part of a run that happens while a display surface is active.
async fn drive_pipeline(
    config: &Config,
    phases: &[Phase],
    executor: &Arc<CommandExecutor>,
    surface: &Arc<dyn UiSurface>,
) -> Result<PipelineResult> {
    let writer = ReportWriter::new(&config.workspace, &config.target)
        .with_context(|| format!("Failed to prepare reports in {}", config.workspace.display()))?;

    let controller = PipelineController::new(
        Arc::clone(executor),
        Arc::clone(surface),
        config.continue_on_error,
        config.step_timeout_secs,
    );

    let result = controller
        .run_pipeline(&config.target, &config.workspace, phases, &writer)
        .await?;

    // A missing summary should not mask the run's own outcome.
    if let Err(e) = writer.finalize(&result) {
        warn!("failed to write run summary: {e}");
    }

    Ok(result)
}

/// Write the built-in plan to `path` so it can be edited and fed back in
/// with `--plan`.
pub fn cmd_plan(target: &str, path: &Path) -> Result<()> {
    let plan = PlanFile {
        generated_at: chrono::Local::now().to_rfc3339(),
        phases: default_plan(),
    };
    plan.save(path)?;
    println!(
        "{} plan for {} written to {}",
        style("✓").green(),
        style(target).bold(),
        path.display()
    );
    Ok(())
}

fn load_phases(config: &Config) -> Result<Vec<Phase>> {
    match &config.plan_file {
        Some(path) => {
            let plan = PlanFile::load(path)?;
            Ok(plan.phases)
        }
        None => Ok(default_plan()),
    }
}

/// Warn about absent tools before anything runs; the run proceeds and each
/// missing tool fails its own step.
fn preflight_tools() {
    let missing = missing_tools(DEFAULT_TOOLS);
    if missing.is_empty() {
        return;
    }
    eprintln!("{}", style("Missing programs detected:").yellow());
    for tool in &missing {
        eprintln!(" - {tool}");
    }
    eprintln!(
        "{} sudo apt install {}",
        style("Install missing programs with:").cyan(),
        missing.join(" ")
    );
}

/// Prefer the dashboard; fall back to plain output when the terminal cannot
/// be taken over (pipes, CI, dumb terminals).
fn bring_up_surface(
    config: &Config,
    tracker: &Arc<Tracker>,
    executor: &Arc<CommandExecutor>,
) -> Result<Arc<dyn UiSurface>> {
    if config.plain {
        let surface = Arc::new(PlainSurface::new(config.verbose));
        surface.start()?;
        return Ok(surface);
    }

    let tui = TuiSurface::new(Arc::clone(tracker), executor.cancellation_token());
    match tui.start() {
        Ok(()) => Ok(Arc::new(tui)),
        Err(UiError::TerminalInit(e)) => {
            warn!("dashboard unavailable ({e}), falling back to plain output");
            let surface = Arc::new(PlainSurface::new(config.verbose));
            surface.start()?;
            Ok(surface)
        }
        Err(e) => Err(e.into()),
    }
}

/// Log to a file under the output directory. The terminal belongs to the
/// display surface, so nothing is ever logged to stdout or stderr.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {}", config.log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(&config.log_dir, "reconflow.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_directive = if config.verbose {
        "reconflow=debug"
    } else {
        "reconflow=info"
    };
    let filter = EnvFilter::try_from_env("RECONFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn print_closing(config: &Config, outcome: &crate::pipeline::RunOutcome) {
    use crate::pipeline::RunOutcome;
    let status = match outcome {
        RunOutcome::Success => style("completed").green().to_string(),
        RunOutcome::Partial => style("completed with failures").yellow().to_string(),
        RunOutcome::Aborted => style("aborted").red().to_string(),
    };
    println!(
        "Run against {} {status}. Reports in {}",
        style(&config.target).bold(),
        config.workspace.display()
    );
}
