use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

/// Destination for one recording session's frames.
pub trait FrameSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Called exactly once, also after a failed append.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens sinks for new sessions.
pub trait SinkFactory: Send + Sync {
    /// File extension of the produced files, without the dot.
    fn extension(&self) -> &'static str;

    fn create(&self, path: &Path) -> Result<Box<dyn FrameSink>>;
}

/// Motion-JPEG stream: one baseline JPEG per appended frame, back to back.
#[derive(Clone, Copy, Debug)]
pub struct MjpegSinkFactory {
    quality: u8,
}

impl MjpegSinkFactory {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl SinkFactory for MjpegSinkFactory {
    fn extension(&self) -> &'static str {
        "mjpeg"
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FrameSink>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create recording {}", path.display()))?;
        Ok(Box::new(MjpegSink {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            quality: self.quality,
        }))
    }
}

struct MjpegSink {
    writer: BufWriter<File>,
    path: PathBuf,
    quality: u8,
}

impl FrameSink for MjpegSink {
    fn append(&mut self, frame: &Frame) -> Result<()> {
        frame
            .write_jpeg(&mut self.writer, self.quality)
            .with_context(|| format!("write frame to {}", self.path.display()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let path = self.path;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flush recording {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync recording {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_sink_writes_one_jpeg_per_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mjpeg");
        let frame = Frame::from_rgb(vec![200u8; 16 * 16 * 3], 16, 16, 1)?;

        let mut sink = MjpegSinkFactory::new(80).create(&path)?;
        sink.append(&frame)?;
        sink.append(&frame)?;
        sink.finish()?;

        let bytes = std::fs::read(&path)?;
        let soi = bytes.windows(2).filter(|w| w == &[0xFF, 0xD8]).count();
        assert_eq!(soi, 2);
        Ok(())
    }

    #[test]
    fn never_overwrites_an_existing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mjpeg");
        std::fs::write(&path, b"evidence")?;
        assert!(MjpegSinkFactory::new(80).create(&path).is_err());
        assert_eq!(std::fs::read(&path)?, b"evidence");
        Ok(())
    }
}
