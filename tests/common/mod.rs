#![allow(dead_code)]

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use watchpost::ingest::SourceStats;
use watchpost::{
    AlertPayload, DeviceOpener, FrameRead, FrameSource, Notifier, SourceId, SourceOpener,
    SourceSpec, SurveillanceConfig,
};

/// Small, fast configuration writing into `dir`.
pub fn test_config(dir: &Path, sources: &[&str]) -> SurveillanceConfig {
    let mut cfg = SurveillanceConfig::from_sources(sources.iter().copied());
    cfg.recording.output_dir = dir.to_path_buf();
    cfg.recording.duration = Duration::from_millis(400);
    cfg.recording.write_interval = Duration::from_millis(20);
    cfg.recording.startup_timeout = Duration::from_millis(200);
    cfg.capture.width = 32;
    cfg.capture.height = 24;
    cfg.loop_interval = Duration::from_millis(5);
    cfg.read_timeout = Duration::from_millis(500);
    cfg.stop_timeout = Duration::from_secs(5);
    cfg
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

/// Opener that tracks how many capture handles are currently open.
#[derive(Default)]
pub struct CountingOpener {
    pub open_handles: Arc<AtomicUsize>,
    pub opens: Arc<AtomicUsize>,
}

impl CountingOpener {
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

impl SourceOpener for CountingOpener {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
        let inner = DeviceOpener.open(spec)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedSource {
            inner,
            open_handles: self.open_handles.clone(),
            closed: false,
        }))
    }
}

struct CountedSource {
    inner: Box<dyn FrameSource>,
    open_handles: Arc<AtomicUsize>,
    closed: bool,
}

impl FrameSource for CountedSource {
    fn id(&self) -> &SourceId {
        self.inner.id()
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        self.inner.read_frame()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

impl Drop for CountedSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Notifier that keeps every payload it was asked to deliver.
#[derive(Default)]
pub struct CollectingNotifier {
    pub delivered: Mutex<Vec<AlertPayload>>,
}

impl CollectingNotifier {
    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl Notifier for CollectingNotifier {
    fn channel(&self) -> &'static str {
        "collect"
    }

    fn notify(&self, payload: &AlertPayload) -> Result<()> {
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
