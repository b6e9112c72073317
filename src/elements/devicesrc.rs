use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::testsrc::{check_geometry, raw_video_caps};
use crate::pipeline::caps::Pads;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::{Buffer, VideoFormat, VideoInfo};

/// Reads fixed-size raw frames from a device node or a file
///
/// A device delivers frames at its own pace; a regular file is paced to
/// `framerate` so a recording from it behaves like a live camera. End of
/// file ends the stream.
pub struct DeviceSrc {
    device: PathBuf,
    format: VideoFormat,
    width: u32,
    height: u32,
    framerate: u32,
    paced: bool,
    file: Option<File>,
    frame: Vec<u8>,
    produced: u64,
    clock: MediaClock,
    name: String,
}

impl DeviceSrc {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let device = options
            .get("device")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("option 'device' is required"))?;
        let format = option_or(options, "format", VideoFormat::I420)?;
        let width = option_or(options, "width", 640)?;
        let height = option_or(options, "height", 480)?;
        check_geometry(format, width, height)?;

        Ok(Self {
            device,
            format,
            width,
            height,
            framerate: option_or(options, "framerate", 30u32)?.max(1),
            paced: option_or(options, "paced", true)?,
            file: None,
            frame: vec![0; format.frame_size(width, height)],
            produced: 0,
            clock: MediaClock::new(),
            name: String::new(),
        })
    }
}

#[async_trait]
impl Stage for DeviceSrc {
    fn pads(&self) -> Pads {
        Pads::source(raw_video_caps(self.format, self.width, self.height, self.framerate))
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        let file = File::open(&self.device)
            .await
            .with_context(|| format!("cannot open {}", self.device.display()))?;
        info!("{}: reading {} from {}", ctx.name, self.format, self.device.display());
        self.file = Some(file);
        self.clock = ctx.clock.clone();
        self.name = ctx.name.clone();
        self.produced = 0;
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<Buffer>> {
        let Some(file) = self.file.as_mut() else {
            return Err(anyhow!("device is not open"));
        };

        let pts = MediaClock::frame_timestamp(self.produced, self.framerate);
        if self.paced {
            let wait = pts.as_duration().saturating_sub(self.clock.running_time());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        match file.read_exact(&mut self.frame).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if self.produced == 0 {
                    warn!("{}: {} holds no complete frame", self.name, self.device.display());
                }
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read from {} failed", self.device.display()));
            }
        }

        self.produced += 1;
        Ok(Some(
            Buffer::new(self.frame.clone(), pts)
                .with_keyframe(true)
                .with_video(VideoInfo {
                    width: self.width,
                    height: self.height,
                    format: Some(self.format),
                }),
        ))
    }

    async fn stop(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}
