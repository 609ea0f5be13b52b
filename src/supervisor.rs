//! Lifecycle of all per-source pipelines.
//!
//! The supervisor owns, per source, the status cell, the latest-frame cache
//! and the alert gate, plus the recording-session table shared by all
//! sources. Runs are strictly sequential: `start_all` on a running
//! supervisor is an error, and `reconfigure` is `stop_all` followed by
//! `start_all` so no pipeline ever observes a config change mid-run.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::alert::AlertGate;
use crate::config::SurveillanceConfig;
use crate::detect::{BackendFactory, DetectorBackend, DetectorFactory};
use crate::error::{ErrorKind, SourceError};
use crate::events::{TriggerEvent, TriggerFeed};
use crate::frame::{Frame, FrameCache};
use crate::ingest::{DeviceOpener, SourceOpener};
use crate::notify::{build_notifier, DeliveryStats, NotificationStats, Notifier, NotifyDispatcher};
use crate::operator::{OperatorDirectory, StaticOperator};
use crate::pipeline::{CaptureWorker, DetectionSettings, SourceContext, TriggerReactor};
use crate::record::{MjpegSinkFactory, Recorder, RecordingSession, RecordingSessions, SinkFactory};
use crate::status::{SourceState, SourceStatus, StatusCell};
use crate::sync::{join_until, lock, StopSignal};
use crate::SourceId;

/// Per-source shared state, kept after a run stops so status stays readable.
struct SourceHandle {
    status: Arc<StatusCell>,
    cache: Arc<FrameCache>,
    gate: Arc<AlertGate>,
}

struct ActiveRun {
    config: SurveillanceConfig,
    stop: StopSignal,
    workers: Vec<(SourceId, JoinHandle<()>)>,
    recorder: Arc<Recorder>,
}

pub struct SurveillanceSupervisor {
    opener: Arc<dyn SourceOpener>,
    detectors: Option<Arc<dyn DetectorFactory>>,
    notifier: Option<Arc<dyn Notifier>>,
    operator: Option<Arc<dyn OperatorDirectory>>,
    sinks: Option<Arc<dyn SinkFactory>>,
    feed: Arc<TriggerFeed>,
    delivery: Arc<DeliveryStats>,
    sessions: Arc<RecordingSessions>,
    run: Mutex<Option<ActiveRun>>,
    sources: RwLock<BTreeMap<SourceId, SourceHandle>>,
}

impl Default for SurveillanceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SurveillanceSupervisor {
    /// Supervisor with the default device opener. Detector, notifier,
    /// operator and recording sink come from each run's configuration
    /// unless overridden with the `with_*` builders.
    pub fn new() -> Self {
        Self {
            opener: Arc::new(DeviceOpener),
            detectors: None,
            notifier: None,
            operator: None,
            sinks: None,
            feed: Arc::new(TriggerFeed::new()),
            delivery: Arc::new(DeliveryStats::default()),
            sessions: Arc::new(RecordingSessions::new()),
            run: Mutex::new(None),
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_source_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_detector_factory(mut self, factory: Arc<dyn DetectorFactory>) -> Self {
        self.detectors = Some(factory);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn OperatorDirectory>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_sink_factory(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    /// Validate `config` and start one capture thread per source.
    ///
    /// A source that fails to open is reported as `Failed` with a capture
    /// error; the others still start. Only configuration problems, a
    /// required detector that cannot be built, or starting twice fail the
    /// whole call.
    pub fn start_all(&self, config: SurveillanceConfig) -> Result<()> {
        let mut run = lock(&self.run);
        if run.is_some() {
            return Err(anyhow!(
                "surveillance is already running; stop it or use reconfigure"
            ));
        }
        config.validate().context("invalid surveillance configuration")?;

        let detectors = self.build_detectors(&config)?;
        let notifier = match &self.notifier {
            Some(notifier) => Some(notifier.clone()),
            None => build_notifier(&config.notify).context("build notifier")?,
        };
        let operator = self
            .operator
            .clone()
            .unwrap_or_else(|| Arc::new(StaticOperator::from_settings(&config.operator)));
        let sinks = self
            .sinks
            .clone()
            .unwrap_or_else(|| Arc::new(MjpegSinkFactory::new(config.recording.jpeg_quality)));
        let recorder = Arc::new(Recorder::new(
            self.sessions.clone(),
            config.recording.clone(),
            sinks,
        ));
        let reactor = Arc::new(TriggerReactor {
            operator,
            dispatcher: notifier.map(|n| NotifyDispatcher::new(n, self.delivery.clone())),
            recorder: recorder.clone(),
            feed: self.feed.clone(),
        });
        let stop = StopSignal::new();

        let mut handles = BTreeMap::new();
        let mut pending = Vec::new();
        for (id, detector) in config.sources.iter().zip(detectors) {
            let handle = SourceHandle {
                status: Arc::new(StatusCell::new(id.clone())),
                cache: Arc::new(FrameCache::new(id.clone())),
                gate: Arc::new(AlertGate::new(id.clone(), config.cooldown)),
            };
            let detector = match detector {
                Ok(detector) => {
                    handle.status.update(|s| s.detector_available = true);
                    Some(detector)
                }
                Err(err) => {
                    handle.status.update(|s| s.detection_error = Some(err));
                    None
                }
            };

            let spec = config.source_spec(id);
            let source = match self.opener.open(&spec) {
                Ok(source) => Some(source),
                Err(err) => {
                    let err = SourceError::from_anyhow(ErrorKind::Capture, &err);
                    log::error!("{} failed to open: {}", id, err);
                    handle.status.fail(err);
                    None
                }
            };

            if source.is_some() || config.restart.max_retries > 0 {
                let worker = CaptureWorker {
                    ctx: SourceContext {
                        id: id.clone(),
                        cache: handle.cache.clone(),
                        gate: handle.gate.clone(),
                        status: handle.status.clone(),
                        stop: stop.clone(),
                    },
                    detector,
                    detection: DetectionSettings {
                        target_label: config.target_label.clone(),
                        min_confidence: config.min_confidence,
                        loop_interval: config.loop_interval,
                    },
                    reactor: reactor.clone(),
                    opener: self.opener.clone(),
                    spec,
                    restart: config.restart.clone(),
                };
                pending.push((id.clone(), worker, source));
            }
            handles.insert(id.clone(), handle);
        }

        *self
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handles;

        let mut workers = Vec::with_capacity(pending.len());
        for (id, worker, source) in pending {
            let spawned = std::thread::Builder::new()
                .name(format!("capture-{}", id.file_stem()))
                .spawn(move || worker.run(source));
            match spawned {
                Ok(handle) => workers.push((id, handle)),
                Err(err) => {
                    stop.trigger();
                    let deadline = Instant::now() + config.stop_timeout;
                    for (_, handle) in workers {
                        join_until(handle, deadline);
                    }
                    return Err(anyhow!("spawn capture thread for {}: {}", id, err));
                }
            }
        }

        log::info!(
            "surveillance started: {} of {} sources capturing, cooldown {:?}, recordings to {}",
            workers.len(),
            config.sources.len(),
            config.cooldown,
            config.recording.output_dir.display()
        );
        *run = Some(ActiveRun {
            config,
            stop,
            workers,
            recorder,
        });
        Ok(())
    }

    fn build_detectors(
        &self,
        config: &SurveillanceConfig,
    ) -> Result<Vec<Result<Box<dyn DetectorBackend>, SourceError>>> {
        let factory = self.detectors.clone().unwrap_or_else(|| {
            Arc::new(BackendFactory::new(
                config.detector.clone(),
                config.target_label.clone(),
            ))
        });
        let mut detectors = Vec::with_capacity(config.sources.len());
        for id in &config.sources {
            match factory.create(id) {
                Ok(detector) => detectors.push(Ok(detector)),
                Err(err) if config.detector.required => {
                    return Err(err.context(format!("detector for {id} is required")));
                }
                Err(err) => {
                    log::warn!(
                        "no detector for {}: {:#}; capturing without detection",
                        id,
                        err
                    );
                    detectors.push(Err(SourceError::from_anyhow(ErrorKind::Config, &err)));
                }
            }
        }
        Ok(detectors)
    }

    /// Stop every capture loop and recording session of the current run.
    ///
    /// Returns once every device handle is released and every session has
    /// closed its output, or fails naming the threads that missed the stop
    /// timeout. A no-op when nothing is running.
    pub fn stop_all(&self) -> Result<()> {
        let mut run = lock(&self.run);
        let Some(active) = run.take() else {
            return Ok(());
        };

        for handle in self.read_sources().values() {
            handle.status.update(|s| {
                if s.state.is_active() {
                    s.state = SourceState::Stopping;
                }
            });
        }
        active.stop.trigger();

        let deadline = Instant::now() + active.config.stop_timeout;
        let stuck_capture: Vec<String> = active
            .workers
            .into_iter()
            .filter_map(|(id, handle)| (!join_until(handle, deadline)).then(|| id.to_string()))
            .collect();
        let stuck_recording: Vec<String> = active
            .recorder
            .join_all(deadline)
            .into_iter()
            .map(|id| id.to_string())
            .collect();

        if !stuck_capture.is_empty() || !stuck_recording.is_empty() {
            return Err(anyhow!(
                "stop timed out after {:?}; capture still running: [{}], recording still running: [{}]",
                active.config.stop_timeout,
                stuck_capture.join(", "),
                stuck_recording.join(", ")
            ));
        }
        log::info!("surveillance stopped");
        Ok(())
    }

    /// Apply a new configuration: stop the current run, start a new one.
    pub fn reconfigure(&self, config: SurveillanceConfig) -> Result<()> {
        self.stop_all().context("stop before reconfigure")?;
        self.start_all(config)
    }

    /// True while a run is active.
    pub fn is_active(&self) -> bool {
        lock(&self.run).is_some()
    }

    /// True while the source's capture loop is starting or running.
    pub fn is_running(&self, source: &SourceId) -> bool {
        self.read_sources()
            .get(source)
            .is_some_and(|h| h.status.snapshot().state.is_active())
    }

    pub fn last_error(&self, source: &SourceId) -> Option<SourceError> {
        self.read_sources()
            .get(source)
            .and_then(|h| h.status.snapshot().last_error)
    }

    pub fn source_status(&self, source: &SourceId) -> Option<SourceStatus> {
        self.read_sources()
            .get(source)
            .map(|h| self.snapshot_of(h))
    }

    /// Status of every configured source, ordered by identifier.
    pub fn status(&self) -> Vec<SourceStatus> {
        self.read_sources()
            .values()
            .map(|h| self.snapshot_of(h))
            .collect()
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.read_sources().keys().cloned().collect()
    }

    /// The source's latest-frame cache, for renderers that poll it.
    pub fn frame_cache(&self, source: &SourceId) -> Option<Arc<FrameCache>> {
        self.read_sources().get(source).map(|h| h.cache.clone())
    }

    pub fn latest_frame(&self, source: &SourceId) -> Option<Arc<Frame>> {
        self.frame_cache(source).and_then(|cache| cache.latest())
    }

    pub fn alert_gate(&self, source: &SourceId) -> Option<Arc<AlertGate>> {
        self.read_sources().get(source).map(|h| h.gate.clone())
    }

    pub fn active_recording(&self, source: &SourceId) -> Option<RecordingSession> {
        self.sessions.active(source)
    }

    /// Receive every trigger event from now on.
    pub fn subscribe(&self) -> Receiver<TriggerEvent> {
        self.feed.subscribe()
    }

    pub fn recent_triggers(&self) -> Vec<TriggerEvent> {
        self.feed.recent()
    }

    pub fn notification_stats(&self) -> NotificationStats {
        self.delivery.snapshot()
    }

    fn snapshot_of(&self, handle: &SourceHandle) -> SourceStatus {
        let mut status = handle.status.snapshot();
        status.recording_active = self.sessions.is_active(&status.source);
        status
    }

    fn read_sources(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<SourceId, SourceHandle>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SurveillanceSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::error!("{:#}", err);
        }
    }
}
