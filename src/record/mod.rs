//! Triggered evidence recording.
//!
//! Each session runs on its own thread and reads frames from the source's
//! `FrameCache`; it never touches the capture device. A supervisor-owned
//! `RecordingSessions` table holds at most one session per source, and a
//! trigger that finds a session active starts nothing.
//!
//! Session timeline, with `t0` the trigger time and `D` the duration limit:
//! - wait for a first cached frame, up to `min(startup_timeout, D)`; no frame
//!   means a failed session and no file
//! - open `<output_dir>/<source>_<timestamp>.<ext>` through the `SinkFactory`
//! - append the latest cached frame every `write_interval` until `t0 + D`
//!   or stop; every wait is bounded by the remaining time
//! - finish the sink and clear the table slot, also on error

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::config::RecordingSettings;
use crate::error::{ErrorKind, SourceError};
use crate::frame::{Frame, FrameCache};
use crate::status::{RecordingOutcome, StatusCell};
use crate::sync::{join_until, lock, StopSignal};
use crate::SourceId;

mod sink;

pub use sink::{FrameSink, MjpegSinkFactory, SinkFactory};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingSession {
    pub source: SourceId,
    pub started_at: Instant,
    pub started_wall: SystemTime,
    pub duration_limit: Duration,
    /// Output file. Created only once a first frame is available.
    pub output: PathBuf,
}

impl RecordingSession {
    pub fn deadline(&self) -> Instant {
        self.started_at + self.duration_limit
    }
}

/// Active sessions keyed by source. At most one entry per source.
#[derive(Debug, Default)]
pub struct RecordingSessions {
    active: Mutex<HashMap<SourceId, RecordingSession>>,
}

impl RecordingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the source's slot. False when a session is already active.
    pub fn try_begin(&self, session: RecordingSession) -> bool {
        let mut active = lock(&self.active);
        if active.contains_key(&session.source) {
            return false;
        }
        active.insert(session.source.clone(), session);
        true
    }

    pub fn finish(&self, source: &SourceId) {
        lock(&self.active).remove(source);
    }

    pub fn active(&self, source: &SourceId) -> Option<RecordingSession> {
        lock(&self.active).get(source).cloned()
    }

    pub fn is_active(&self, source: &SourceId) -> bool {
        lock(&self.active).contains_key(source)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

/// Output file name for a session started at `started_wall`.
pub fn output_file_name(source: &SourceId, started_wall: SystemTime, extension: &str) -> String {
    let stamp = chrono::DateTime::<chrono::Local>::from(started_wall).format("%Y%m%dT%H%M%S_%3f");
    format!("{}_{}.{}", source.unique_stem(), stamp, extension)
}

/// Starts recording sessions for one surveillance run.
pub struct Recorder {
    sessions: Arc<RecordingSessions>,
    settings: RecordingSettings,
    sinks: Arc<dyn SinkFactory>,
    threads: Mutex<Vec<(SourceId, JoinHandle<()>)>>,
}

impl Recorder {
    pub fn new(
        sessions: Arc<RecordingSessions>,
        settings: RecordingSettings,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            sessions,
            settings,
            sinks,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start a session for `source` unless one is active.
    ///
    /// Returns `Ok(None)` when the slot is taken. The session thread owns the
    /// slot from here on and clears it when it exits.
    pub(crate) fn start(
        &self,
        source: &SourceId,
        cache: Arc<FrameCache>,
        status: Arc<StatusCell>,
        stop: StopSignal,
    ) -> Result<Option<RecordingSession>> {
        let started_wall = SystemTime::now();
        let output = self.settings.output_dir.join(output_file_name(
            source,
            started_wall,
            self.sinks.extension(),
        ));
        let started_at = Instant::now();
        if started_at.checked_add(self.settings.duration).is_none() {
            return Err(anyhow!(
                "recording duration {:?} is out of range",
                self.settings.duration
            ));
        }
        let session = RecordingSession {
            source: source.clone(),
            started_at,
            started_wall,
            duration_limit: self.settings.duration,
            output,
        };
        if !self.sessions.try_begin(session.clone()) {
            return Ok(None);
        }

        let guard = SlotGuard {
            sessions: self.sessions.clone(),
            source: source.clone(),
        };
        let job = SessionJob {
            session: session.clone(),
            write_interval: self.settings.write_interval,
            startup_timeout: self.settings.startup_timeout,
            sinks: self.sinks.clone(),
            cache,
            stop,
        };
        let handle = std::thread::Builder::new()
            .name(format!("record-{}", source.file_stem()))
            .spawn(move || {
                let _guard = guard;
                let source = job.session.source.clone();
                let outcome = match job.run() {
                    Ok(Some((path, frames))) => {
                        log::info!(
                            "recording for {} closed: {} ({} frames)",
                            source,
                            path.display(),
                            frames
                        );
                        Some(RecordingOutcome::Completed {
                            path: path.display().to_string(),
                            frames,
                        })
                    }
                    Ok(None) => None,
                    Err(err) => {
                        let err = SourceError::from_anyhow(ErrorKind::Recording, &err);
                        log::error!("recording for {} failed: {}", source, err);
                        Some(RecordingOutcome::Failed {
                            message: err.message,
                        })
                    }
                };
                if let Some(outcome) = outcome {
                    status.update(|s| s.last_recording = Some(outcome));
                }
            })
            .context("spawn recording thread")?;

        let mut threads = lock(&self.threads);
        threads.retain(|(_, handle)| !handle.is_finished());
        threads.push((source.clone(), handle));
        Ok(Some(session))
    }

    /// Join every session thread. Returns the sources whose session was
    /// still running at `deadline`.
    pub(crate) fn join_all(&self, deadline: Instant) -> Vec<SourceId> {
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        threads
            .into_iter()
            .filter_map(|(source, handle)| (!join_until(handle, deadline)).then_some(source))
            .collect()
    }
}

/// Clears the session slot when the session thread exits, however it exits.
struct SlotGuard {
    sessions: Arc<RecordingSessions>,
    source: SourceId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.sessions.finish(&self.source);
    }
}

struct SessionJob {
    session: RecordingSession,
    write_interval: Duration,
    startup_timeout: Duration,
    sinks: Arc<dyn SinkFactory>,
    cache: Arc<FrameCache>,
    stop: StopSignal,
}

impl SessionJob {
    /// `Ok(None)` when stopped before any frame arrived.
    fn run(&self) -> Result<Option<(PathBuf, u64)>> {
        let Some(first) = self.wait_first_frame()? else {
            log::info!(
                "recording for {} stopped before a first frame",
                self.session.source
            );
            return Ok(None);
        };

        let path = self.session.output.clone();
        let mut sink = self.sinks.create(&path)?;
        log::info!(
            "recording {} to {} for {:?}",
            self.session.source,
            path.display(),
            self.session.duration_limit
        );
        let written = self.write_frames(sink.as_mut(), first);
        let finished = sink.finish();
        let frames = written?;
        finished?;
        Ok(Some((path, frames)))
    }

    fn wait_first_frame(&self) -> Result<Option<Arc<Frame>>> {
        let limit = self.startup_timeout.min(self.session.duration_limit);
        let startup_deadline = self.session.started_at + limit;
        let mut waiting_logged = false;
        loop {
            if let Some(frame) = self.cache.latest() {
                return Ok(Some(frame));
            }
            if !waiting_logged {
                log::info!(
                    "recording for {} waiting for a first frame",
                    self.session.source
                );
                waiting_logged = true;
            }
            let now = Instant::now();
            if now >= startup_deadline {
                return Err(anyhow!(
                    "no frame from {} within {:?}",
                    self.session.source,
                    limit
                ));
            }
            if self
                .stop
                .wait_timeout(self.write_interval.min(startup_deadline - now))
            {
                return Ok(None);
            }
        }
    }

    fn write_frames(&self, sink: &mut dyn FrameSink, first: Arc<Frame>) -> Result<u64> {
        let deadline = self.session.deadline();
        let mut frame = first;
        let mut frames = 0u64;
        loop {
            sink.append(&frame)?;
            frames += 1;

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.stop.wait_timeout(self.write_interval.min(deadline - now)) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            if let Some(latest) = self.cache.latest() {
                frame = latest;
            }
        }
        Ok(frames)
    }
}
