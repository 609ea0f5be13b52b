//! V4L2 frame source.
//!
//! Captures from local cameras addressed either by index (`"0"` maps to
//! `/dev/video0`) or by device path. Frames are requested as RGB24; NV12
//! devices are converted in-process. Every read is bounded by the source's
//! read timeout.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameRead, FrameSource, SourceSpec, SourceStats};
use crate::frame::Frame;
use crate::SourceId;

/// Resolve a configured identifier to a device node path.
pub(crate) fn device_path(id: &SourceId) -> String {
    let raw = id.as_str().trim();
    if raw.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{raw}")
    } else {
        raw.to_string()
    }
}

/// List camera indices in `0..max` that can be opened right now.
pub fn probe_devices(max: u32) -> Vec<u32> {
    (0..max)
        .filter(|index| match v4l::Device::new(*index as usize) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("probe: /dev/video{} unavailable: {}", index, err);
                false
            }
        })
        .collect()
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Source {
    spec: SourceSpec,
    path: String,
    state: Option<DeviceState>,
    pixel_format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
}

impl V4l2Source {
    pub fn new(spec: SourceSpec) -> Result<Self> {
        Ok(Self {
            path: device_path(&spec.id),
            active_width: spec.width,
            active_height: spec.height,
            spec,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            frame_count: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.spec.width;
        format.height = self.spec.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", self.path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "{} negotiated unsupported pixel format {}",
                    self.path,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.spec.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.spec.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", self.path, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let read_timeout = self.spec.read_timeout;
        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| {
                            anyhow::Error::new(err).context("create v4l2 buffer stream")
                        })?;
                stream.set_timeout(read_timeout);
                Ok::<_, anyhow::Error>(stream)
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.path,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    fn id(&self) -> &SourceId {
        &self.spec.id
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let width = self.active_width;
        let height = self.active_height;
        let format = self.pixel_format;
        // Copy out of the mmap buffer before the driver reuses it.
        let pixels = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            normalize_to_rgb(&buf[..used], width, height, format)
        })?;

        self.frame_count += 1;
        let frame = Frame::from_rgb(pixels, width, height, self.frame_count)?;
        Ok(FrameRead::Frame(frame))
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: released {} after {} frames",
                self.path,
                self.frame_count
            );
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}
