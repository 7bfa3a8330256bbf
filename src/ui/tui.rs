//! Two-pane terminal dashboard, rendered via `ratatui`.
//!
//! Left pane: phase progress gauge plus the bounded status feed. Right pane:
//! the live output tail from the currently running tool. A background thread
//! owns the terminal and redraws from [`Tracker`] snapshots on a fixed tick;
//! the pipeline never blocks on rendering.
//!
//! Key bindings:
//! - `q` closes the dashboard; the run keeps going in the background
//! - `c` clears the output pane, `r` clears the status feed
//! - `s` toggles the status panel
//! - Ctrl-C requests cancellation of the run

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::Terminal;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Gauge, List, ListItem, Paragraph};
use tokio_util::sync::CancellationToken;

use crate::errors::UiError;
use crate::tracker::{OutputLine, Severity, StatusMessage, StreamKind, Tracker, TrackerSnapshot};
use crate::ui::UiSurface;

pub struct TuiSurface {
    tracker: Arc<Tracker>,
    /// Stops the render thread only; the pipeline keeps running.
    ui_cancel: CancellationToken,
    /// Fired when the user asks to cancel the run itself.
    run_cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<io::Result<()>>>>,
    display_seq: AtomicU64,
    tick: Duration,
}

impl TuiSurface {
    pub fn new(tracker: Arc<Tracker>, run_cancel: CancellationToken) -> Self {
        Self {
            tracker,
            ui_cancel: CancellationToken::new(),
            run_cancel,
            handle: Mutex::new(None),
            display_seq: AtomicU64::new(0),
            tick: Duration::from_millis(100),
        }
    }
}

impl UiSurface for TuiSurface {
    /// Take over the terminal and start the render thread.
    ///
    /// Any terminal setup failure is reported as [`UiError::TerminalInit`] so
    /// the caller can fall back to the plain surface.
    fn start(&self) -> Result<(), UiError> {
        terminal::enable_raw_mode().map_err(UiError::TerminalInit)?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen).map_err(UiError::TerminalInit)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend).map_err(UiError::TerminalInit)?;

        let tracker = Arc::clone(&self.tracker);
        let ui_cancel = self.ui_cancel.clone();
        let run_cancel = self.run_cancel.clone();
        let tick = self.tick;
        let handle = std::thread::spawn(move || {
            let result = render_loop(terminal, &tracker, &ui_cancel, &run_cancel, tick);
            restore_terminal();
            result
        });

        *self.handle.lock().expect("ui handle lock poisoned") = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), UiError> {
        self.ui_cancel.cancel();
        let handle = self.handle.lock().expect("ui handle lock poisoned").take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("dashboard render loop ended with error: {e}"),
                Err(_) => return Err(UiError::ThreadPanicked),
            }
        }
        Ok(())
    }

    fn update_status(&self, text: &str, severity: Severity, phase: Option<&str>, percent: u8) {
        let phase = phase.unwrap_or("");
        self.tracker
            .push_status(StatusMessage::new(text, severity, phase));
        if !phase.is_empty() {
            self.tracker.set_phase(phase, percent);
        }
    }

    fn append_output(&self, line: &str, stream: StreamKind) {
        let seq = self.display_seq.fetch_add(1, Ordering::Relaxed);
        self.tracker.push_output(OutputLine {
            seq,
            stream,
            text: line.to_string(),
        });
    }
}

/// Draw-poll loop. Returns when the UI is closed; the run itself is only
/// affected through `run_cancel`.
fn render_loop(
    mut terminal: Terminal<CrosstermBackend<io::Stdout>>,
    tracker: &Tracker,
    ui_cancel: &CancellationToken,
    run_cancel: &CancellationToken,
    tick: Duration,
) -> io::Result<()> {
    let mut show_status = true;
    loop {
        if ui_cancel.is_cancelled() {
            return Ok(());
        }

        let snapshot = tracker.snapshot();
        terminal.draw(|frame| render_frame(frame, &snapshot, show_status))?;

        if event::poll(tick)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                // Ctrl-C cancels the run and closes the dashboard.
                if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
                    run_cancel.cancel();
                    return Ok(());
                }
                match key.code {
                    KeyCode::Char('q') => return Ok(()),
                    KeyCode::Char('c') => tracker.clear_output(),
                    KeyCode::Char('r') => tracker.clear_status(),
                    KeyCode::Char('s') => show_status = !show_status,
                    _ => {}
                }
            }
        }
    }
}

fn restore_terminal() {
    let _ = terminal::disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
}

fn render_frame(frame: &mut Frame, snapshot: &TrackerSnapshot, show_status: bool) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    if show_status {
        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(rows[0]);

        let left = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0)])
            .split(panes[0]);

        render_gauge(frame, left[0], snapshot);
        render_status(frame, left[1], snapshot);
        render_output(frame, panes[1], snapshot);
    } else {
        // Status hidden: the output pane takes the full width.
        let body = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0)])
            .split(rows[0]);

        render_gauge(frame, body[0], snapshot);
        render_output(frame, body[1], snapshot);
    }
    render_footer(frame, rows[1]);
}

fn render_gauge(frame: &mut Frame, area: Rect, snapshot: &TrackerSnapshot) {
    let title = if snapshot.phase.is_empty() {
        "Progress".to_string()
    } else {
        format!("Progress — {}", snapshot.phase)
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(u16::from(snapshot.percent.min(100)));
    frame.render_widget(gauge, area);
}

fn render_status(frame: &mut Frame, area: Rect, snapshot: &TrackerSnapshot) {
    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = tail(&snapshot.status, visible)
        .iter()
        .map(|msg| {
            let style = severity_style(msg.severity);
            let line = Line::from(vec![
                Span::styled(format!("{} ", msg.severity.icon()), style),
                Span::raw(format!("{} ", msg.timestamp.format("%H:%M:%S"))),
                Span::styled(msg.text.clone(), style),
            ]);
            ListItem::new(line)
        })
        .collect();

    let list =
        List::new(items).block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(list, area);
}

fn render_output(frame: &mut Frame, area: Rect, snapshot: &TrackerSnapshot) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = tail(&snapshot.output, visible)
        .iter()
        .map(|line| match line.stream {
            StreamKind::Stdout => Line::from(line.text.clone()),
            StreamKind::Stderr => Line::from(Span::styled(
                line.text.clone(),
                Style::default().fg(Color::Yellow),
            )),
        })
        .collect();

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Live Output"));
    frame.render_widget(paragraph, area);
}

fn render_footer(frame: &mut Frame, area: Rect) {
    let footer = Paragraph::new(Line::from(Span::styled(
        " q close dashboard | c clear output | r clear status | s toggle status | Ctrl-C cancel run",
        Style::default().fg(Color::DarkGray),
    )));
    frame.render_widget(footer, area);
}

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Info => Style::default().fg(Color::Cyan),
        Severity::Success => Style::default().fg(Color::Green),
        Severity::Warning => Style::default().fg(Color::Yellow),
        Severity::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

/// Last `max` elements of a slice, in order.
fn tail<T>(items: &[T], max: usize) -> &[T] {
    let start = items.len().saturating_sub(max);
    &items[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_latest_in_order() {
        let items = [1, 2, 3, 4, 5];
        assert_eq!(tail(&items, 3), &[3, 4, 5]);
        assert_eq!(tail(&items, 10), &items);
        assert_eq!(tail(&items, 0), &[] as &[i32]);
    }

    #[test]
    fn test_append_output_assigns_increasing_display_order() {
        let tracker = Arc::new(Tracker::default());
        let surface = TuiSurface::new(Arc::clone(&tracker), CancellationToken::new());

        surface.append_output("one", StreamKind::Stdout);
        surface.append_output("two", StreamKind::Stderr);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.output.len(), 2);
        assert!(snapshot.output[0].seq < snapshot.output[1].seq);
        assert_eq!(snapshot.output[1].stream, StreamKind::Stderr);
    }

    #[test]
    fn test_update_status_records_phase_and_percent() {
        let tracker = Arc::new(Tracker::default());
        let surface = TuiSurface::new(Arc::clone(&tracker), CancellationToken::new());

        surface.update_status("running nmap", Severity::Info, Some("Scanning"), 40);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, "Scanning");
        assert_eq!(snapshot.percent, 40);
        assert_eq!(snapshot.status.len(), 1);
        assert_eq!(snapshot.status[0].text, "running nmap");
    }
}
