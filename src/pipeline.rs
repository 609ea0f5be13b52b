//! Per-source capture loop and trigger reaction.
//!
//! One `CaptureWorker` runs on each source's thread. It owns the open
//! `FrameSource` and the source's detector, so nothing here is shared with
//! another source except the recorder's session table and the trigger feed,
//! both of which take short per-call locks.

use anyhow::Error;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::alert::{AlertGate, TriggerDecision};
use crate::config::RestartPolicy;
use crate::detect::{Detection, DetectorBackend};
use crate::error::{ErrorKind, SourceError};
use crate::events::{TriggerEvent, TriggerFeed};
use crate::frame::FrameCache;
use crate::ingest::{FrameRead, FrameSource, SourceOpener, SourceSpec};
use crate::notify::{AlertPayload, NotifyDispatcher};
use crate::operator::OperatorDirectory;
use crate::record::Recorder;
use crate::status::{SourceState, StatusCell};
use crate::sync::StopSignal;
use crate::SourceId;

/// Why a capture loop returned.
#[derive(Debug)]
pub(crate) enum LoopExit {
    Stopped,
    Ended,
    Failed(Error),
}

/// Side effects of a permitted trigger, shared by every source of a run.
pub(crate) struct TriggerReactor {
    pub(crate) operator: Arc<dyn OperatorDirectory>,
    pub(crate) dispatcher: Option<NotifyDispatcher>,
    pub(crate) recorder: Arc<Recorder>,
    pub(crate) feed: Arc<TriggerFeed>,
}

impl TriggerReactor {
    fn on_trigger(&self, ctx: &SourceContext, hit: &Detection) {
        let at = SystemTime::now();

        let mut notified = false;
        if let Some(dispatcher) = &self.dispatcher {
            if self.operator.notifications_enabled() {
                let payload = AlertPayload::new(
                    ctx.id.clone(),
                    at,
                    &hit.label,
                    hit.confidence,
                    self.operator.recipient(),
                );
                match dispatcher.dispatch(payload) {
                    Ok(()) => notified = true,
                    Err(err) => log::warn!("alert for {} not dispatched: {:#}", ctx.id, err),
                }
            } else {
                log::debug!("notifications disabled; no alert for {}", ctx.id);
            }
        }

        let recording_started = match self.recorder.start(
            &ctx.id,
            ctx.cache.clone(),
            ctx.status.clone(),
            ctx.stop.clone(),
        ) {
            Ok(Some(_)) => true,
            Ok(None) => {
                log::debug!("recording already active for {}", ctx.id);
                false
            }
            Err(err) => {
                let err = SourceError::from_anyhow(ErrorKind::Recording, &err);
                log::error!("recording for {} not started: {}", ctx.id, err);
                ctx.status.update(|s| {
                    s.last_recording = Some(crate::status::RecordingOutcome::Failed {
                        message: err.message,
                    })
                });
                false
            }
        };

        log::info!(
            "trigger on {}: {} ({:.2}) notified={} recording={}",
            ctx.id,
            hit.label,
            hit.confidence,
            notified,
            recording_started
        );
        self.feed.publish(TriggerEvent {
            source: ctx.id.clone(),
            at,
            label: hit.label.clone(),
            confidence: hit.confidence,
            notified,
            recording_started,
        });
    }
}

/// Shared per-source state the loop publishes into.
pub(crate) struct SourceContext {
    pub(crate) id: SourceId,
    pub(crate) cache: Arc<FrameCache>,
    pub(crate) gate: Arc<AlertGate>,
    pub(crate) status: Arc<StatusCell>,
    pub(crate) stop: StopSignal,
}

pub(crate) struct DetectionSettings {
    pub(crate) target_label: String,
    pub(crate) min_confidence: f32,
    pub(crate) loop_interval: Duration,
}

pub(crate) struct CaptureWorker {
    pub(crate) ctx: SourceContext,
    pub(crate) detector: Option<Box<dyn DetectorBackend>>,
    pub(crate) detection: DetectionSettings,
    pub(crate) reactor: Arc<TriggerReactor>,
    pub(crate) opener: Arc<dyn SourceOpener>,
    pub(crate) spec: SourceSpec,
    pub(crate) restart: RestartPolicy,
}

impl CaptureWorker {
    /// Thread body: run the loop, reopening the source on capture failure
    /// while the restart policy allows it.
    ///
    /// `initial` is `None` when the first open already failed; the worker
    /// then starts with the restart backoff.
    pub(crate) fn run(mut self, initial: Option<Box<dyn FrameSource>>) {
        let mut attempts = 0u32;
        let mut next = initial;
        loop {
            let mut source = match next.take() {
                Some(source) => source,
                None => match self.reopen(&mut attempts) {
                    Some(source) => source,
                    None => {
                        if self.ctx.stop.is_triggered() {
                            self.ctx.status.set_state(SourceState::Stopped);
                        } else {
                            self.ctx.status.set_state(SourceState::Failed);
                        }
                        return;
                    }
                },
            };
            self.ctx.status.set_state(SourceState::Running);
            let exit = self.capture_loop(source.as_mut());
            source.close();
            let captured = source.stats().frames_captured;

            let err = match exit {
                LoopExit::Stopped => {
                    self.ctx.status.set_state(SourceState::Stopped);
                    log::info!("{} stopped after {} frames", self.ctx.id, captured);
                    return;
                }
                LoopExit::Ended => {
                    self.ctx.status.set_state(SourceState::Ended);
                    log::info!("{} reached end of stream after {} frames", self.ctx.id, captured);
                    return;
                }
                LoopExit::Failed(err) => err,
            };

            let err = SourceError::from_anyhow(ErrorKind::Capture, &err);
            log::error!("{}: {}", self.ctx.id, err);
            self.ctx.status.fail(err);
        }
    }

    /// Back off and reopen. `None` when retries are exhausted or stop fired.
    fn reopen(&self, attempts: &mut u32) -> Option<Box<dyn FrameSource>> {
        while *attempts < self.restart.max_retries {
            *attempts += 1;
            self.ctx.status.set_state(SourceState::Starting);
            log::info!(
                "reopening {} in {:?} (attempt {}/{})",
                self.ctx.id,
                self.restart.backoff,
                attempts,
                self.restart.max_retries
            );
            if self.ctx.stop.wait_timeout(self.restart.backoff) {
                return None;
            }
            match self.opener.open(&self.spec) {
                Ok(source) => {
                    self.ctx.status.update(|s| s.restarts += 1);
                    return Some(source);
                }
                Err(err) => {
                    let err = SourceError::from_anyhow(ErrorKind::Capture, &err);
                    log::warn!("reopen of {} failed: {}", self.ctx.id, err);
                    self.ctx.status.update(|s| s.last_error = Some(err));
                }
            }
        }
        None
    }

    fn capture_loop(&mut self, source: &mut dyn FrameSource) -> LoopExit {
        loop {
            if self.ctx.stop.is_triggered() {
                return LoopExit::Stopped;
            }

            let frame = match source.read_frame() {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::EndOfStream) => return LoopExit::Ended,
                Err(err) => {
                    if self.ctx.stop.is_triggered() {
                        return LoopExit::Stopped;
                    }
                    return LoopExit::Failed(err);
                }
            };
            let frame = self.ctx.cache.publish(frame);
            self.ctx.status.update(|s| s.frames_captured += 1);

            if let Some(detector) = self.detector.as_mut() {
                match detector.detect(&frame) {
                    Ok(result) => {
                        if let Some(hit) = result.best_match(
                            &self.detection.target_label,
                            self.detection.min_confidence,
                        ) {
                            self.ctx.status.update(|s| s.detections += 1);
                            self.on_sighting(hit);
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            "{}: detection failed on frame {}: {:#}",
                            self.ctx.id,
                            frame.sequence,
                            err
                        );
                        let err = SourceError::from_anyhow(ErrorKind::Detection, &err);
                        self.ctx.status.update(|s| {
                            s.detection_errors += 1;
                            s.detection_error = Some(err);
                        });
                    }
                }
            }

            if self.ctx.stop.wait_timeout(self.detection.loop_interval) {
                return LoopExit::Stopped;
            }
        }
    }

    fn on_sighting(&self, hit: &Detection) {
        match self.ctx.gate.try_trigger(Instant::now()) {
            TriggerDecision::Permitted => {
                self.ctx.status.update(|s| s.triggers += 1);
                self.reactor.on_trigger(&self.ctx, hit);
            }
            TriggerDecision::Suppressed => {
                self.ctx.status.update(|s| s.suppressed += 1);
                log::debug!(
                    "{}: {} ({:.2}) suppressed by cooldown",
                    self.ctx.id,
                    hit.label,
                    hit.confidence
                );
            }
        }
    }
}
