use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::frame::Frame;

/// Confidence reported for every stub sighting.
const STUB_CONFIDENCE: f32 = 0.85;

/// Stub backend for tests and demos.
///
/// Hashes the pixels of each frame and reports one sighting of `label`
/// whenever the hash differs from the previous frame's, i.e. whenever the
/// scene changed.
pub struct StubBackend {
    label: String,
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_hash: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new("person")
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if motion {
            Ok(DetectionResult::new(vec![Detection::new(
                self.label.clone(),
                STUB_CONFIDENCE,
            )]))
        } else {
            Ok(DetectionResult::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> Frame {
        Frame::from_rgb(vec![value; 4 * 4 * 3], 4, 4, 1).unwrap()
    }

    #[test]
    fn stub_backend_reports_scene_changes() -> Result<()> {
        let mut backend = StubBackend::new("person");

        assert!(backend.detect(&frame(1))?.is_empty());

        let changed = backend.detect(&frame(2))?;
        assert_eq!(changed.detections, vec![Detection::new("person", 0.85)]);

        assert!(backend.detect(&frame(2))?.is_empty());
        Ok(())
    }
}
