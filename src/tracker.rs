//! Shared state between the pipeline and the UI surface.
//!
//! The [`Tracker`] holds the two bounded display buffers (status messages and
//! live output lines) plus the current phase label and progress percent. It is
//! the only state that crosses the pipeline/UI boundary; everything goes
//! through one mutex. Eviction here affects the display copy only; the full
//! captured output always lives in the `ExecutionResult` and the report
//! artifacts.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Default cap on retained status messages.
pub const DEFAULT_STATUS_CAP: usize = 20;
/// Default cap on retained live output lines.
pub const DEFAULT_OUTPUT_CAP: usize = 1000;

/// Severity of a status message, drives the icon and color in both UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Single-character icon used by both the TUI and the plain fallback.
    pub fn icon(self) -> &'static str {
        match self {
            Severity::Info => "ℹ",
            Severity::Success => "✓",
            Severity::Warning => "⚠",
            Severity::Error => "✗",
        }
    }
}

/// Which stream of the child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One entry in the status panel.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub timestamp: DateTime<Local>,
    pub text: String,
    pub severity: Severity,
    pub phase: String,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>, severity: Severity, phase: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
            severity,
            phase: phase.into(),
        }
    }
}

/// One entry in the live output panel.
///
/// `seq` is assigned by the executor and strictly increases within a single
/// stream of a single invocation.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: StreamKind,
    pub text: String,
}

/// Immutable view of the tracker for one render pass.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub status: Vec<StatusMessage>,
    pub output: Vec<OutputLine>,
    pub phase: String,
    pub percent: u8,
}

struct TrackerInner {
    status: VecDeque<StatusMessage>,
    output: VecDeque<OutputLine>,
    phase: String,
    percent: u8,
}

/// Thread-safe, bounded, append-only store for display state.
pub struct Tracker {
    inner: Mutex<TrackerInner>,
    status_cap: usize,
    output_cap: usize,
}

impl Tracker {
    pub fn new(status_cap: usize, output_cap: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                status: VecDeque::with_capacity(status_cap),
                output: VecDeque::with_capacity(output_cap.min(1024)),
                phase: String::new(),
                percent: 0,
            }),
            status_cap,
            output_cap,
        }
    }

    /// Append a status message, evicting the oldest entry at the cap.
    pub fn push_status(&self, message: StatusMessage) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if inner.status.len() >= self.status_cap {
            inner.status.pop_front();
        }
        inner.status.push_back(message);
    }

    /// Append a live output line, evicting the oldest entry at the cap.
    pub fn push_output(&self, line: OutputLine) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if inner.output.len() >= self.output_cap {
            inner.output.pop_front();
        }
        inner.output.push_back(line);
    }

    /// Update the phase label and progress percent.
    ///
    /// Percent is clamped to 100 and never decreases within the same phase;
    /// switching to a new phase label resets it.
    pub fn set_phase(&self, phase: &str, percent: u8) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let percent = percent.min(100);
        if inner.phase == phase {
            inner.percent = inner.percent.max(percent);
        } else {
            inner.phase = phase.to_string();
            inner.percent = percent;
        }
    }

    /// Clone out everything a renderer needs for one frame.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.inner.lock().expect("tracker lock");
        TrackerSnapshot {
            status: inner.status.iter().cloned().collect(),
            output: inner.output.iter().cloned().collect(),
            phase: inner.phase.clone(),
            percent: inner.percent,
        }
    }

    /// Drop all status messages (runtime `clear status` command).
    pub fn clear_status(&self) {
        self.inner.lock().expect("tracker lock").status.clear();
    }

    /// Drop all output lines (runtime `clear output` command).
    pub fn clear_output(&self) {
        self.inner.lock().expect("tracker lock").output.clear();
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAP, DEFAULT_OUTPUT_CAP)
    }
}
