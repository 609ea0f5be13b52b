mod common;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{files_in, test_config, wait_for, CollectingNotifier, CountingOpener};
use watchpost::detect::{BackendFactory, DetectionResult, DetectorBackend, DetectorFactory};
use watchpost::status::RecordingOutcome;
use watchpost::{
    ErrorKind, Frame, SourceId, SourceState, StaticOperator, SurveillanceSupervisor,
};

const WAIT: Duration = Duration::from_secs(5);

fn id(raw: &str) -> SourceId {
    SourceId::new(raw)
}

#[test]
fn stalled_source_does_not_hold_back_a_healthy_one() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(dir.path(), &["stub://stalled?stall=1", "stub://healthy"]);
    cfg.read_timeout = Duration::from_millis(1_500);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg)?;

    let stalled = id("stub://stalled?stall=1");
    let healthy = id("stub://healthy");
    assert!(wait_for(Duration::from_millis(1_000), || {
        supervisor
            .source_status(&healthy)
            .is_some_and(|s| s.frames_captured >= 10)
    }));
    let stalled_status = supervisor.source_status(&stalled).unwrap();
    assert_eq!(stalled_status.frames_captured, 0);
    assert!(supervisor.latest_frame(&stalled).is_none());

    assert!(wait_for(WAIT, || !supervisor.is_running(&stalled)));
    let err = supervisor.last_error(&stalled).expect("capture error recorded");
    assert_eq!(err.kind, ErrorKind::Capture);
    assert!(err.message.contains("stalled"));
    assert!(supervisor.is_running(&healthy));
    assert!(supervisor.latest_frame(&healthy).is_some());

    supervisor.stop_all()?;
    assert_eq!(
        supervisor.source_status(&healthy).unwrap().state,
        SourceState::Stopped
    );
    assert_eq!(
        supervisor.source_status(&stalled).unwrap().state,
        SourceState::Failed
    );
    Ok(())
}

#[test]
fn one_trigger_within_cooldown_starts_one_recording_and_one_alert() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://door?motion_every=1"]);
    let notifier = Arc::new(CollectingNotifier::default());
    let supervisor = SurveillanceSupervisor::new().with_notifier(notifier.clone());
    let triggers = supervisor.subscribe();
    supervisor.start_all(cfg)?;

    let door = id("stub://door?motion_every=1");
    assert!(wait_for(WAIT, || supervisor
        .source_status(&door)
        .is_some_and(|s| s.suppressed >= 10)));
    let status = supervisor.source_status(&door).unwrap();
    assert_eq!(status.triggers, 1);
    assert!(status.detections >= 11);

    let event = triggers.recv_timeout(WAIT)?;
    assert_eq!(event.source, door);
    assert_eq!(event.label, "person");
    assert!(event.notified);
    assert!(event.recording_started);
    assert!(triggers.try_recv().is_err());

    assert!(wait_for(WAIT, || supervisor.active_recording(&door).is_none()));
    assert!(wait_for(WAIT, || supervisor.notification_stats().delivered == 1));
    supervisor.stop_all()?;

    assert_eq!(files_in(dir.path()).len(), 1);
    assert_eq!(supervisor.recent_triggers().len(), 1);
    assert_eq!(notifier.count(), 1);
    assert_eq!(notifier.delivered.lock().unwrap()[0].source, door);
    Ok(())
}

#[test]
fn recording_closes_by_its_deadline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://yard?motion_every=1"]);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg)?;

    let yard = id("stub://yard?motion_every=1");
    let mut session = None;
    assert!(wait_for(WAIT, || {
        session = supervisor.active_recording(&yard);
        session.is_some()
    }));
    let session = session.unwrap();
    assert_eq!(session.duration_limit, Duration::from_millis(400));
    assert!(supervisor.source_status(&yard).unwrap().recording_active);

    assert!(wait_for(WAIT, || supervisor.active_recording(&yard).is_none()));
    assert!(Instant::now() <= session.deadline() + Duration::from_millis(300));

    let status = supervisor.source_status(&yard).unwrap();
    assert!(!status.recording_active);
    match status.last_recording {
        Some(RecordingOutcome::Completed { frames, .. }) => assert!(frames >= 2),
        other => panic!("unexpected recording outcome {other:?}"),
    }
    let bytes = std::fs::read(&session.output)?;
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn stop_all_releases_handles_and_closes_sessions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(
        dir.path(),
        &[
            "stub://a?motion_every=1",
            "stub://b?motion_every=1",
            "stub://c?motion_every=100000",
        ],
    );
    cfg.recording.duration = Duration::from_secs(60);
    let opener = Arc::new(CountingOpener::default());
    let supervisor = SurveillanceSupervisor::new().with_source_opener(opener.clone());
    supervisor.start_all(cfg)?;
    assert_eq!(opener.open_handles(), 3);

    let a = id("stub://a?motion_every=1");
    let b = id("stub://b?motion_every=1");
    assert!(wait_for(WAIT, || supervisor.active_recording(&a).is_some()
        && supervisor.active_recording(&b).is_some()));

    let started = Instant::now();
    supervisor.stop_all()?;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(opener.open_handles(), 0);
    assert!(supervisor.active_recording(&a).is_none());
    assert!(supervisor.active_recording(&b).is_none());
    assert!(!supervisor.is_active());
    for status in supervisor.status() {
        assert_eq!(status.state, SourceState::Stopped, "{}", status.source);
        assert!(!status.recording_active);
    }
    let files = files_in(dir.path());
    assert_eq!(files.len(), 2);
    for file in files {
        assert!(std::fs::metadata(&file)?.len() > 0);
    }

    // Stopping again is a no-op.
    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn reconfigure_applies_new_cooldown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://gate?motion_every=1"]);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg.clone())?;

    let gate = id("stub://gate?motion_every=1");
    assert!(wait_for(WAIT, || supervisor
        .source_status(&gate)
        .is_some_and(|s| s.suppressed >= 3)));
    assert_eq!(supervisor.source_status(&gate).unwrap().triggers, 1);

    let mut relaxed = cfg;
    relaxed.cooldown = Duration::ZERO;
    supervisor.reconfigure(relaxed)?;
    assert_eq!(
        supervisor.alert_gate(&gate).unwrap().cooldown(),
        Duration::ZERO
    );
    assert!(wait_for(WAIT, || supervisor
        .source_status(&gate)
        .is_some_and(|s| s.triggers >= 3)));
    assert!(supervisor.is_running(&gate));

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn starting_twice_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://a"]);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg.clone())?;
    assert!(supervisor.start_all(cfg).is_err());
    assert!(supervisor.is_running(&id("stub://a")));
    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn invalid_config_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["stub://a"]);
    cfg.recording.output_dir = dir.path().join("missing");
    let supervisor = SurveillanceSupervisor::new();
    assert!(supervisor.start_all(cfg).is_err());
    assert!(!supervisor.is_active());
    assert!(supervisor.status().is_empty());
}

#[test]
fn open_failure_is_isolated_to_its_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://gone?open_error=1", "stub://ok"]);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg)?;

    let gone = id("stub://gone?open_error=1");
    let status = supervisor.source_status(&gone).unwrap();
    assert_eq!(status.state, SourceState::Failed);
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::Capture);
    assert!(supervisor.is_running(&id("stub://ok")));

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn end_of_stream_is_not_a_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://clip?end_after=5"]);
    let supervisor = SurveillanceSupervisor::new();
    supervisor.start_all(cfg)?;

    let clip = id("stub://clip?end_after=5");
    assert!(wait_for(WAIT, || !supervisor.is_running(&clip)));
    let status = supervisor.source_status(&clip).unwrap();
    assert_eq!(status.state, SourceState::Ended);
    assert_eq!(status.frames_captured, 5);
    assert!(status.last_error.is_none());

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn restart_policy_reopens_failed_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(dir.path(), &["stub://flaky?fail_after=3"]);
    cfg.restart.max_retries = 2;
    cfg.restart.backoff = Duration::from_millis(20);
    let opener = Arc::new(CountingOpener::default());
    let supervisor = SurveillanceSupervisor::new().with_source_opener(opener.clone());
    supervisor.start_all(cfg)?;

    let flaky = id("stub://flaky?fail_after=3");
    assert!(wait_for(WAIT, || supervisor
        .source_status(&flaky)
        .is_some_and(|s| s.restarts == 2 && s.state == SourceState::Failed)));
    let status = supervisor.source_status(&flaky).unwrap();
    assert_eq!(status.frames_captured, 9);
    assert_eq!(opener.opens.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert_eq!(opener.open_handles(), 0);

    supervisor.stop_all()?;
    Ok(())
}

struct UnavailableDetectors;

impl DetectorFactory for UnavailableDetectors {
    fn create(&self, _source: &SourceId) -> Result<Box<dyn DetectorBackend>> {
        Err(anyhow!("model file missing"))
    }
}

#[test]
fn missing_optional_detector_keeps_capturing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://a?motion_every=1"]);
    let supervisor =
        SurveillanceSupervisor::new().with_detector_factory(Arc::new(UnavailableDetectors));
    supervisor.start_all(cfg)?;

    let a = id("stub://a?motion_every=1");
    assert!(wait_for(WAIT, || supervisor
        .source_status(&a)
        .is_some_and(|s| s.frames_captured >= 10)));
    let status = supervisor.source_status(&a).unwrap();
    assert!(!status.detector_available);
    let cause = status.detection_error.expect("detector build error kept");
    assert_eq!(cause.kind, ErrorKind::Config);
    assert!(cause.message.contains("model file missing"));
    assert_eq!(status.triggers, 0);
    assert!(supervisor.active_recording(&a).is_none());

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn missing_required_detector_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["stub://a"]);
    cfg.detector.required = true;
    let supervisor =
        SurveillanceSupervisor::new().with_detector_factory(Arc::new(UnavailableDetectors));
    let err = supervisor.start_all(cfg).unwrap_err();
    assert!(format!("{err:#}").contains("model file missing"));
    assert!(!supervisor.is_active());
}

struct BrokenDetector;

impl DetectorBackend for BrokenDetector {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
        Err(anyhow!("inference failed"))
    }
}

struct BrokenDetectors;

impl DetectorFactory for BrokenDetectors {
    fn create(&self, _source: &SourceId) -> Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(BrokenDetector))
    }
}

#[test]
fn detector_errors_count_as_no_detection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://a?motion_every=1"]);
    let supervisor =
        SurveillanceSupervisor::new().with_detector_factory(Arc::new(BrokenDetectors));
    supervisor.start_all(cfg)?;

    let a = id("stub://a?motion_every=1");
    assert!(wait_for(WAIT, || supervisor
        .source_status(&a)
        .is_some_and(|s| s.detection_errors >= 5)));
    let status = supervisor.source_status(&a).unwrap();
    assert_eq!(status.state, SourceState::Running);
    assert_eq!(status.triggers, 0);
    assert!(status.detector_available);
    let last = status.detection_error.expect("last detection error kept");
    assert_eq!(last.kind, ErrorKind::Detection);
    assert!(last.message.contains("inference failed"));
    assert!(status.last_error.is_none());

    supervisor.stop_all()?;
    Ok(())
}

#[test]
fn disabled_notifications_still_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(dir.path(), &["stub://a?motion_every=1"]);
    let notifier = Arc::new(CollectingNotifier::default());
    let operator = Arc::new(StaticOperator::new(false, None));
    let supervisor = SurveillanceSupervisor::new()
        .with_notifier(notifier.clone())
        .with_operator(operator);
    let triggers = supervisor.subscribe();
    supervisor.start_all(cfg)?;

    let event = triggers.recv_timeout(WAIT)?;
    assert!(!event.notified);
    assert!(event.recording_started);

    supervisor.stop_all()?;
    assert_eq!(notifier.count(), 0);
    assert_eq!(supervisor.notification_stats().dispatched, 0);
    Ok(())
}

#[test]
fn default_factory_uses_configured_target_label() -> Result<()> {
    let factory = BackendFactory::new(Default::default(), "intruder");
    let mut detector = factory.create(&id("stub://a"))?;
    let first = Frame::from_rgb(vec![1; 4 * 4 * 3], 4, 4, 1)?;
    let second = Frame::from_rgb(vec![2; 4 * 4 * 3], 4, 4, 2)?;
    detector.detect(&first)?;
    let result = detector.detect(&second)?;
    assert!(result.best_match("intruder", 0.5).is_some());
    Ok(())
}
