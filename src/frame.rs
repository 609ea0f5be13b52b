//! Frames and the per-source latest-frame cache.
//!
//! - `Frame`: immutable RGB24 image. Pixels sit behind an `Arc<[u8]>`, so
//!   cloning a frame never copies pixels and nothing can mutate them after
//!   capture.
//! - `FrameCache`: one slot per source holding the most recent frame. The
//!   owning capture loop is the only writer; the renderer, the status API and
//!   the recorder read concurrently.
//!
//! Publishing swaps an `Arc` under a per-slot lock. A reader therefore sees
//! either the previous frame or the new one, never a half-written buffer.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::SourceId;

/// Bytes per RGB24 pixel.
pub const RGB_CHANNELS: usize = 3;

#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Per-source capture sequence number, starting at 1.
    pub sequence: u64,
    /// Wall-clock capture time (for file names and reports).
    pub captured_at: SystemTime,
    captured_instant: Instant,
}

impl Frame {
    /// Build a frame from tightly packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            sequence,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_instant(&self) -> Instant {
        self.captured_instant
    }

    pub fn age(&self) -> Duration {
        self.captured_instant.elapsed()
    }

    /// Encode the frame as one baseline JPEG into `out`.
    pub fn write_jpeg<W: Write>(&self, out: &mut W, quality: u8) -> Result<()> {
        JpegEncoder::new_with_quality(out, quality.clamp(1, 100))
            .encode(
                self.pixels(),
                self.width,
                self.height,
                ExtendedColorType::Rgb8,
            )
            .context("encode frame as JPEG")
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_jpeg(&mut out, quality)?;
        Ok(out)
    }
}

/// Latest-frame slot for one source.
#[derive(Debug)]
pub struct FrameCache {
    source: SourceId,
    slot: RwLock<Option<Arc<Frame>>>,
    published: AtomicU64,
}

impl FrameCache {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            slot: RwLock::new(None),
            published: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Replace the cached frame. Only the source's capture loop calls this.
    ///
    /// Returns the shared handle so the caller can keep working on the exact
    /// frame readers now see.
    pub(crate) fn publish(&self, frame: Frame) -> Arc<Frame> {
        let frame = Arc::new(frame);
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.replace(frame.clone())
        };
        // Drop the old frame outside the lock.
        drop(previous);
        self.published.fetch_add(1, Ordering::Release);
        frame
    }

    /// Most recent frame, or `None` before the first capture.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of frames published since the cache was created.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}
