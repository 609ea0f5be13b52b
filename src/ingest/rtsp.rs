//! RTSP frame source using GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps.
//! The appsink keeps one buffer and drops older ones, so a slow pipeline
//! always reads the newest decoded frame. A pull that produces nothing
//! within the read timeout is reported as a stalled stream.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::{FrameRead, FrameSource, SourceSpec, SourceStats};
use crate::frame::Frame;
use crate::SourceId;

pub struct RtspSource {
    spec: SourceSpec,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    playing: bool,
    last_error: Option<String>,
}

impl RtspSource {
    pub fn new(spec: SourceSpec) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            spec.id
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            spec,
            pipeline,
            appsink,
            frame_count: 0,
            playing: false,
            last_error: None,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.playing = true;
        log::info!("RtspSource: connected to {}", self.spec.id);
        Ok(())
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("end of stream".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn id(&self) -> &SourceId {
        &self.spec.id
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            if err == "end of stream" {
                return Ok(FrameRead::EndOfStream);
            }
            return Err(anyhow!("{}: {}", self.spec.id, err));
        }
        if self.appsink.is_eos() {
            return Ok(FrameRead::EndOfStream);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.spec.read_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| {
                anyhow!(
                    "{} stalled: no frame within {:?}",
                    self.spec.id,
                    self.spec.read_timeout
                )
            })?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        let frame = Frame::from_rgb(pixels, width, height, self.frame_count)?;
        Ok(FrameRead::Frame(frame))
    }

    fn close(&mut self) {
        if self.playing {
            self.playing = false;
            if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop {}: {}", self.spec.id, err);
            }
            log::info!(
                "RtspSource: released {} after {} frames",
                self.spec.id,
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

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Ok((pixels, width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
