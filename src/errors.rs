//! Typed error hierarchy for the reconflow pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `ExecutorError`: process plumbing failures (tool outcomes are data, not errors)
//! - `ReportError`: artifact persistence failures, surfaced as warnings
//! - `UiError`: terminal initialization failures, trigger the plain fallback

use thiserror::Error;

/// Errors from the command executor.
///
/// These cover only plumbing failures: a tool that exits non-zero, is
/// missing, times out, or gets cancelled produces an
/// [`crate::executor::ExecutionResult`] with the appropriate classification
/// instead of an error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn shell for command `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {stream} pipe of child process")]
    PipeMissing { stream: &'static str },

    #[error("I/O error while streaming child output: {0}")]
    StreamIo(#[source] std::io::Error),

    #[error("Failed to wait for child process: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the report writer.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report artifact at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run summary: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors from the terminal UI surface.
#[derive(Debug, Error)]
pub enum UiError {
    #[error("Failed to initialize terminal: {0}")]
    TerminalInit(#[source] std::io::Error),

    #[error("UI thread panicked")]
    ThreadPanicked,
}
