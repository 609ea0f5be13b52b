//! Terminal presentation for the binaries: startup stages and status lines.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::events::TriggerEvent;
use crate::status::{RecordingOutcome, SourceState, SourceStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Announce a startup/shutdown stage; the guard reports its duration.
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// One line per source.
    pub fn status_table(&self, statuses: &[SourceStatus]) -> String {
        let width = statuses
            .iter()
            .map(|s| s.source.as_str().len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for status in statuses {
            let marker = if self.pretty() {
                state_marker(status.state)
            } else {
                "-"
            };
            let _ = write!(
                out,
                "{marker} {:<width$}  {:<8} frames={} triggers={} suppressed={}",
                status.source.as_str(),
                state_name(status.state),
                status.frames_captured,
                status.triggers,
                status.suppressed,
            );
            if !status.detector_available {
                out.push_str(" detector=off");
            }
            if let Some(err) = &status.detection_error {
                let _ = write!(out, " detector_error=\"{}\"", err.message);
            }
            if status.recording_active {
                out.push_str(" recording");
            }
            if let Some(RecordingOutcome::Failed { message }) = &status.last_recording {
                let _ = write!(out, " last_recording_failed=\"{message}\"");
            }
            if let Some(err) = &status.last_error {
                let _ = write!(out, " error=\"{err}\"");
            }
            out.push('\n');
        }
        out
    }
}

pub fn trigger_line(event: &TriggerEvent) -> String {
    let stamp = chrono::DateTime::<chrono::Local>::from(event.at).format("%H:%M:%S");
    format!(
        "[{stamp}] {} saw {} ({:.0}%) notified={} recording={}",
        event.source,
        event.label,
        event.confidence * 100.0,
        event.notified,
        event.recording_started
    )
}

fn state_name(state: SourceState) -> &'static str {
    match state {
        SourceState::Starting => "starting",
        SourceState::Running => "running",
        SourceState::Stopping => "stopping",
        SourceState::Stopped => "stopped",
        SourceState::Ended => "ended",
        SourceState::Failed => "failed",
    }
}

fn state_marker(state: SourceState) -> &'static str {
    match state {
        SourceState::Starting | SourceState::Running => "●",
        SourceState::Stopping | SourceState::Stopped | SourceState::Ended => "○",
        SourceState::Failed => "✖",
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SourceError};
    use crate::SourceId;

    #[test]
    fn plain_status_table_lists_every_source() {
        let ui = Ui::new(UiMode::Plain, false);
        let mut healthy = SourceStatus::new(SourceId::new("stub://a"));
        healthy.state = SourceState::Running;
        healthy.detector_available = true;
        healthy.frames_captured = 12;
        healthy.detection_error = Some(SourceError::new(ErrorKind::Detection, "bad tensor"));
        let mut broken = SourceStatus::new(SourceId::new("0"));
        broken.state = SourceState::Failed;
        broken.last_error = Some(SourceError::new(ErrorKind::Capture, "device busy"));

        let table = ui.status_table(&[healthy, broken]);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("running") && lines[0].contains("frames=12"));
        assert!(lines[0].contains("detector_error=\"bad tensor\""));
        assert!(lines[1].contains("failed"));
        assert!(lines[1].contains("capture error: device busy"));
        assert!(lines[1].contains("detector=off"));
    }

    #[test]
    fn format_duration_switches_units() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
