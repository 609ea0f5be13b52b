//! Per-source status reported to operators.

use serde::Serialize;
use std::sync::Mutex;

use crate::error::SourceError;
use crate::sync::lock;
use crate::SourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Configured, capture thread not yet looping.
    Starting,
    Running,
    /// Stop requested, loop not yet exited.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// The stream reported end of stream.
    Ended,
    /// Capture failed; see `last_error`.
    Failed,
}

impl SourceState {
    pub fn is_active(self) -> bool {
        matches!(self, SourceState::Starting | SourceState::Running)
    }
}

/// Result of the most recent recording session for a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordingOutcome {
    Completed { path: String, frames: u64 },
    Failed { message: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceStatus {
    pub source: SourceId,
    pub state: SourceState,
    pub last_error: Option<SourceError>,
    pub frames_captured: u64,
    pub detections: u64,
    pub detection_errors: u64,
    /// Most recent detector failure: a per-frame inference error, or the
    /// reason no detector could be built for this source.
    pub detection_error: Option<SourceError>,
    pub triggers: u64,
    pub suppressed: u64,
    pub detector_available: bool,
    pub recording_active: bool,
    pub last_recording: Option<RecordingOutcome>,
    pub restarts: u32,
}

impl SourceStatus {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            state: SourceState::Starting,
            last_error: None,
            frames_captured: 0,
            detections: 0,
            detection_errors: 0,
            detection_error: None,
            triggers: 0,
            suppressed: 0,
            detector_available: false,
            recording_active: false,
            last_recording: None,
            restarts: 0,
        }
    }
}

/// Mutable status slot owned by one source. Each source has its own lock.
#[derive(Debug)]
pub(crate) struct StatusCell {
    inner: Mutex<SourceStatus>,
}

impl StatusCell {
    pub(crate) fn new(source: SourceId) -> Self {
        Self {
            inner: Mutex::new(SourceStatus::new(source)),
        }
    }

    pub(crate) fn update<F: FnOnce(&mut SourceStatus)>(&self, f: F) {
        f(&mut lock(&self.inner));
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        self.update(|s| s.state = state);
    }

    pub(crate) fn fail(&self, error: SourceError) {
        self.update(|s| {
            s.state = SourceState::Failed;
            s.last_error = Some(error);
        });
    }

    pub(crate) fn snapshot(&self) -> SourceStatus {
        lock(&self.inner).clone()
    }
}
