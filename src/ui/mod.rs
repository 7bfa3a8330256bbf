//! Display surfaces for a pipeline run.
//!
//! The pipeline talks to the terminal only through [`UiSurface`]. Two
//! implementations exist: the two-pane ratatui dashboard ([`tui::TuiSurface`])
//! and a line-printing fallback ([`plain::PlainSurface`]) for non-tty
//! environments or `--plain` runs.

pub mod plain;
pub mod tui;

pub use plain::PlainSurface;
pub use tui::TuiSurface;

use crate::errors::UiError;
use crate::tracker::{Severity, StreamKind};

/// Push-based display surface. All methods are safe to call from the pipeline
/// task while a render thread is active.
pub trait UiSurface: Send + Sync {
    /// Bring the surface up. For the rich surface this takes over the
    /// terminal; failure here is the signal to fall back to plain output.
    fn start(&self) -> Result<(), UiError>;

    /// Tear the surface down and restore the terminal.
    fn stop(&self) -> Result<(), UiError>;

    /// Record a status event and the current phase progress.
    fn update_status(&self, text: &str, severity: Severity, phase: Option<&str>, percent: u8);

    /// Record one line of live tool output.
    fn append_output(&self, line: &str, stream: StreamKind);
}
