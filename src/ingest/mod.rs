//! Frame sources.
//!
//! This module provides the sources a pipeline can capture from:
//! - Synthetic `stub://` sources (tests, demos)
//! - USB/V4L2 devices by index or path (feature: ingest-v4l2)
//! - RTSP streams (feature: rtsp-gstreamer)
//!
//! Every source:
//! - Produces frames in capture order
//! - Copies pixels out of the device buffer before handing a `Frame` over
//! - Bounds every blocking read by the configured read timeout; a timeout is
//!   a capture error, never a silent retry

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::Frame;
use crate::SourceId;

#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{probe_devices, V4l2Source};

/// Outcome of one blocking read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    EndOfStream,
}

/// Capture statistics for a source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
}

/// An open capture handle.
///
/// `read_frame` blocks until a frame arrives, the stream ends, or the read
/// timeout expires (reported as an error). `close` releases the device;
/// it must be safe to call more than once.
pub trait FrameSource: Send {
    fn id(&self) -> &SourceId;

    fn read_frame(&mut self) -> Result<FrameRead>;

    fn close(&mut self);

    fn stats(&self) -> SourceStats;
}

/// How to open one source.
#[derive(Clone, Debug)]
pub struct SourceSpec {
    pub id: SourceId,
    /// Upper bound for a single blocking read.
    pub read_timeout: Duration,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl SourceSpec {
    pub fn new(id: SourceId, read_timeout: Duration) -> Self {
        Self {
            id,
            read_timeout,
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Opens capture handles. The supervisor calls this at start and when a
/// restart policy reopens a failed source.
pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Synthetic,
    Rtsp,
    Device,
}

pub(crate) fn classify(id: &SourceId) -> Result<SourceKind> {
    let raw = id.as_str().trim();
    if raw.is_empty() {
        return Err(anyhow!("source identifier is empty"));
    }
    if raw.starts_with("stub://") {
        return Ok(SourceKind::Synthetic);
    }
    if raw.starts_with("rtsp://") || raw.starts_with("rtsps://") {
        return Ok(SourceKind::Rtsp);
    }
    if raw.contains("://") {
        return Err(anyhow!("unsupported source scheme in '{}'", raw));
    }
    Ok(SourceKind::Device)
}

/// Default opener: dispatches on the identifier's form.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceOpener;

impl SourceOpener for DeviceOpener {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
        match classify(&spec.id)? {
            SourceKind::Synthetic => {
                let mut source = SyntheticSource::new(spec.clone())?;
                source.connect()?;
                Ok(Box::new(source))
            }
            SourceKind::Rtsp => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    let mut source = RtspSource::new(spec.clone())?;
                    source.connect()?;
                    Ok(Box::new(source))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
                }
            }
            SourceKind::Device => {
                #[cfg(feature = "ingest-v4l2")]
                {
                    let mut source = V4l2Source::new(spec.clone())?;
                    source.connect()?;
                    Ok(Box::new(source))
                }
                #[cfg(not(feature = "ingest-v4l2"))]
                {
                    Err(anyhow!("local cameras require the ingest-v4l2 feature"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_identifier_form() {
        assert_eq!(
            classify(&SourceId::new("stub://front")).unwrap(),
            SourceKind::Synthetic
        );
        assert_eq!(
            classify(&SourceId::new("rtsp://cam.local/stream")).unwrap(),
            SourceKind::Rtsp
        );
        assert_eq!(classify(&SourceId::new("0")).unwrap(), SourceKind::Device);
        assert_eq!(
            classify(&SourceId::new("/dev/video2")).unwrap(),
            SourceKind::Device
        );
        assert!(classify(&SourceId::new("http://cam.local/mjpeg")).is_err());
        assert!(classify(&SourceId::new("  ")).is_err());
    }

    #[test]
    fn device_opener_opens_synthetic_sources() -> Result<()> {
        let spec = SourceSpec::new(SourceId::new("stub://door"), Duration::from_millis(100));
        let mut source = DeviceOpener.open(&spec)?;
        assert!(matches!(source.read_frame()?, FrameRead::Frame(_)));
        source.close();
        Ok(())
    }
}
