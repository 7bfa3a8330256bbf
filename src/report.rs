//! Markdown and JSON report writing.
//!
//! Every run produces, under the output root:
//! - `record.md`: the master log, every command of every phase with a
//!   timestamp, appended in dispatch order
//! - `<phase-slug>/<phase-slug>.md`: per-phase artifact with each command
//!   and its captured output
//! - `summary.json`: machine-readable run summary, written at the end
//!
//! `ReportWriter` is the pipeline's [`ReportSink`]; write failures are
//! surfaced as [`ReportError`] and the pipeline logs and keeps going.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use serde::Serialize;

use crate::errors::ReportError;
use crate::executor::{CommandInvocation, ExecutionResult, extract_ip};
use crate::phase::{Phase, PhaseState, StepSpec};
use crate::pipeline::{PipelineResult, ReportSink};

/// Master log file name at the output root.
pub const RECORD_FILE: &str = "record.md";
/// Run summary file name at the output root.
pub const SUMMARY_FILE: &str = "summary.json";

/// Incremental markdown document builder.
#[derive(Default)]
pub struct MarkdownBuilder {
    parts: Vec<String>,
}

impl MarkdownBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a level-one heading, capitalizing the first character.
    pub fn title(&mut self, title: &str) -> &mut Self {
        let mut chars = title.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        };
        self.parts.push(format!("# {capitalized}\n"));
        self
    }

    /// Add a command as a fenced bash block.
    pub fn command(&mut self, command: &str) -> &mut Self {
        self.parts.push(format!("```bash\n{command}\n```\n"));
        self
    }

    /// Add captured output as a fenced block under an **Output** marker.
    pub fn command_output(&mut self, output: &str) -> &mut Self {
        self.parts.push(format!(
            "**Output**\n\n```\n{}\n```\n",
            output.trim_end()
        ));
        self
    }

    pub fn line(&mut self, text: &str) -> &mut Self {
        self.parts.push(format!("{text}\n"));
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.parts.push("\n".to_string());
        self
    }

    pub fn text(&self) -> String {
        self.parts.concat()
    }

    /// Append the document to `path`, creating parent directories as needed.
    pub fn append_to(&self, path: &Path) -> Result<(), ReportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ReportError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ReportError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        file.write_all(self.text().as_bytes())
            .map_err(|source| ReportError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Writes the run's reports under a single output root.
pub struct ReportWriter {
    root: PathBuf,
    record_path: PathBuf,
    /// First IPv4 address observed in any step's stdout, for the summary.
    target_ip: Mutex<Option<String>>,
}

impl ReportWriter {
    /// Create the output root and start `record.md`.
    pub fn new(root: &Path, target: &str) -> Result<Self, ReportError> {
        std::fs::create_dir_all(root).map_err(|source| ReportError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let record_path = root.join(RECORD_FILE);
        let mut doc = MarkdownBuilder::new();
        doc.title("Record")
            .line(&format!(
                "Target: `{target}` — started {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ))
            .blank();
        doc.append_to(&record_path)?;

        Ok(Self {
            root: root.to_path_buf(),
            record_path,
            target_ip: Mutex::new(None),
        })
    }

    fn phase_artifact(&self, phase: &Phase) -> PathBuf {
        let slug = phase.slug();
        self.root.join(&slug).join(format!("{slug}.md"))
    }

    /// Write `summary.json` for a finished run.
    pub fn finalize(&self, result: &PipelineResult) -> Result<(), ReportError> {
        let summary = Summary {
            generated_at: Local::now().to_rfc3339(),
            target_ip: self.target_ip.lock().expect("report lock poisoned").clone(),
            result,
        };
        let json =
            serde_json::to_string_pretty(&summary).map_err(ReportError::Serialize)?;
        let path = self.root.join(SUMMARY_FILE);
        std::fs::write(&path, json).map_err(|source| ReportError::Io { path, source })?;

        let mut doc = MarkdownBuilder::new();
        doc.blank()
            .line(&format!("Finished with outcome: {:?}", result.outcome));
        doc.append_to(&self.record_path)
    }
}

impl ReportSink for ReportWriter {
    fn on_phase_start(&self, phase: &Phase) -> Result<(), ReportError> {
        let mut doc = MarkdownBuilder::new();
        doc.title(&phase.name).blank();
        doc.append_to(&self.phase_artifact(phase))?;

        let mut record = MarkdownBuilder::new();
        record.line(&format!(
            "## {} — {}",
            phase.name,
            Local::now().format("%H:%M:%S")
        ));
        record.append_to(&self.record_path)
    }

    /// The master log records every command as it is dispatched, before any
    /// output exists, so an aborted run still shows what was attempted.
    fn on_step_start(
        &self,
        _phase: &Phase,
        step: &StepSpec,
        invocation: &CommandInvocation,
    ) -> Result<(), ReportError> {
        let mut record = MarkdownBuilder::new();
        record
            .line(&format!(
                "{} — {}",
                Local::now().format("%H:%M:%S"),
                step.label
            ))
            .command(&invocation.command);
        record.append_to(&self.record_path)
    }

    fn on_step_result(
        &self,
        phase: &Phase,
        _step: &StepSpec,
        result: &ExecutionResult,
    ) -> Result<(), ReportError> {
        if let Some(ip) = extract_ip(&result.stdout) {
            let mut slot = self.target_ip.lock().expect("report lock poisoned");
            slot.get_or_insert(ip);
        }

        // The output block is written even when empty, so a silent tool
        // still leaves a visible record in the artifact.
        let mut doc = MarkdownBuilder::new();
        doc.command(&result.command);
        doc.command_output(&result.stdout);
        if !result.stderr.is_empty() {
            doc.line("**Stderr**").command_output(&result.stderr);
        }
        doc.blank();
        doc.append_to(&self.phase_artifact(phase))
    }

    fn on_phase_end(&self, phase: &Phase, state: PhaseState) -> Result<(), ReportError> {
        let mut doc = MarkdownBuilder::new();
        doc.blank().line(&format!("Phase finished: {state:?}"));
        doc.append_to(&self.phase_artifact(phase))
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    generated_at: String,
    target_ip: Option<String>,
    #[serde(flatten)]
    result: &'a PipelineResult,
}
