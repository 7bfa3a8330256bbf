//! Plain-terminal surface, rendered via `indicatif` and `console`.
//!
//! Used when the rich dashboard cannot take over the terminal, or when the
//! user asks for `--plain`. Status events print as styled lines above a
//! single progress bar; live tool output is shown only in verbose runs.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::errors::UiError;
use crate::tracker::{Severity, StreamKind};
use crate::ui::UiSurface;

pub struct PlainSurface {
    bar: ProgressBar,
    verbose: bool,
}

impl PlainSurface {
    pub fn new(verbose: bool) -> Self {
        let bar_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let bar = ProgressBar::new(100);
        bar.set_style(bar_style);
        bar.set_prefix("Progress");

        Self { bar, verbose }
    }

    /// Print above the progress bar so the bar is not clobbered.
    fn print_line(&self, msg: String) {
        self.bar.println(msg);
    }
}

impl UiSurface for PlainSurface {
    fn start(&self) -> Result<(), UiError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), UiError> {
        self.bar.finish_and_clear();
        Ok(())
    }

    fn update_status(&self, text: &str, severity: Severity, phase: Option<&str>, percent: u8) {
        self.bar.set_position(u64::from(percent.min(100)));
        if let Some(phase) = phase {
            self.bar.set_message(phase.to_string());
        }

        let icon = severity.icon();
        let line = match severity {
            Severity::Info => format!("{} {}", style(icon).cyan(), text),
            Severity::Success => format!("{} {}", style(icon).green(), text),
            Severity::Warning => format!("{} {}", style(icon).yellow(), style(text).yellow()),
            Severity::Error => format!("{} {}", style(icon).red(), style(text).red().bold()),
        };
        self.print_line(line);
    }

    fn append_output(&self, line: &str, stream: StreamKind) {
        if !self.verbose {
            return;
        }
        match stream {
            StreamKind::Stdout => self.print_line(format!("  {}", style(line).dim())),
            StreamKind::Stderr => self.print_line(format!("  {}", style(line).yellow().dim())),
        }
    }
}
