use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Detector backend trait.
///
/// One instance serves exactly one source, so `detect` may keep per-stream
/// state (previous frame hashes, tracker state) behind `&mut self` without
/// any locking between sources.
///
/// `detect` runs inline in the capture loop: its latency throttles that
/// source's frame rate and nothing else.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Errors count as "no detection this frame".
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
