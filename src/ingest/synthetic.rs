//! Synthetic frame source (`stub://`).
//!
//! Generates a static scene that changes every `motion_every` frames, which
//! is exactly what the stub detector reacts to. Query options shape the
//! source's behaviour so tests can reproduce failing hardware:
//!
//! | option          | effect                                            |
//! |-----------------|---------------------------------------------------|
//! | `motion_every=N`| scene change period in frames (default 50)        |
//! | `fail_after=N`  | read error after N frames                         |
//! | `end_after=N`   | end of stream after N frames                      |
//! | `stall=1`       | never produces; each read times out               |
//! | `open_error=1`  | opening fails                                     |
//! | `width`/`height`| frame size                                        |

use anyhow::{anyhow, Result};

use super::{FrameRead, FrameSource, SourceSpec, SourceStats};
use crate::frame::{Frame, RGB_CHANNELS};
use crate::SourceId;

#[derive(Clone, Debug, PartialEq, Eq)]
struct SyntheticOptions {
    motion_every: u64,
    fail_after: Option<u64>,
    end_after: Option<u64>,
    stall: bool,
    open_error: bool,
    width: u32,
    height: u32,
}

impl SyntheticOptions {
    fn parse(spec: &SourceSpec) -> Result<Self> {
        let mut options = Self {
            motion_every: 50,
            fail_after: None,
            end_after: None,
            stall: false,
            open_error: false,
            width: spec.width,
            height: spec.height,
        };
        let Some((_, query)) = spec.id.as_str().split_once('?') else {
            return Ok(options);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
            let number = || -> Result<u64> {
                value
                    .parse()
                    .map_err(|_| anyhow!("stub option '{}' expects an integer, got '{}'", key, value))
            };
            match key {
                "motion_every" => options.motion_every = number()?.max(1),
                "fail_after" => options.fail_after = Some(number()?),
                "end_after" => options.end_after = Some(number()?),
                "stall" => options.stall = number()? != 0,
                "open_error" => options.open_error = number()? != 0,
                "width" => options.width = dimension(key, number()?)?,
                "height" => options.height = dimension(key, number()?)?,
                other => return Err(anyhow!("unknown stub option '{}'", other)),
            }
        }
        if options.width == 0 || options.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        Ok(options)
    }
}

fn dimension(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| anyhow!("stub option '{}' is out of range: {}", key, value))
}

pub struct SyntheticSource {
    spec: SourceSpec,
    options: SyntheticOptions,
    frame_count: u64,
    /// Simulated scene; a change reads as motion to the stub detector.
    scene_state: u8,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(spec: SourceSpec) -> Result<Self> {
        let options = SyntheticOptions::parse(&spec)?;
        Ok(Self {
            spec,
            options,
            frame_count: 0,
            scene_state: 0,
            connected: false,
        })
    }

    /// Synthetic sources are always reachable unless told otherwise.
    pub fn connect(&mut self) -> Result<()> {
        if self.options.open_error {
            return Err(anyhow!("cannot open {}: device not found", self.spec.id));
        }
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.spec.id);
        Ok(())
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % self.options.motion_every == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count =
            self.options.width as usize * self.options.height as usize * RGB_CHANNELS;
        let scene = self.scene_state as usize * 37;
        (0..pixel_count).map(|i| ((i + scene) % 256) as u8).collect()
    }
}

impl FrameSource for SyntheticSource {
    fn id(&self) -> &SourceId {
        &self.spec.id
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        if !self.connected {
            return Err(anyhow!("{} is not connected", self.spec.id));
        }
        if self.options.stall {
            std::thread::sleep(self.spec.read_timeout);
            return Err(anyhow!(
                "{} stalled: no frame within {:?}",
                self.spec.id,
                self.spec.read_timeout
            ));
        }
        if self.options.end_after == Some(self.frame_count) {
            return Ok(FrameRead::EndOfStream);
        }
        if self.options.fail_after == Some(self.frame_count) {
            return Err(anyhow!(
                "{} read failed after {} frames",
                self.spec.id,
                self.frame_count
            ));
        }

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        let frame = Frame::from_rgb(
            pixels,
            self.options.width,
            self.options.height,
            self.frame_count,
        )?;
        Ok(FrameRead::Frame(frame))
    }

    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            log::info!(
                "SyntheticSource: closed {} after {} frames",
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

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.close();
    }
}
