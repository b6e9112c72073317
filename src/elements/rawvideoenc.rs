use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::debug;

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::stage::{Stage, StageContext, StageOptions};
use crate::pipeline::types::{Buffer, VideoFormat};

/// Packs I420 frames as self-contained `video/x-i420` access units
///
/// Every frame is intra, so every output buffer is a keyframe.
pub struct RawVideoEnc {
    name: String,
    geometry: Option<(u32, u32)>,
    frames: u64,
}

impl RawVideoEnc {
    pub fn from_options(_options: &StageOptions) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            geometry: None,
            frames: 0,
        })
    }
}

#[async_trait]
impl Stage for RawVideoEnc {
    fn pads(&self) -> Pads {
        Pads::filter(
            Caps::builder("video/x-raw").field("format", VideoFormat::I420).build(),
            Caps::builder("video/x-i420").build(),
        )
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        self.name = ctx.name.clone();
        self.geometry = None;
        self.frames = 0;
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let info = buffer
            .video
            .ok_or_else(|| anyhow!("frame without video info"))?;

        // The container header carries one geometry for the whole stream
        match self.geometry {
            None => {
                debug!("{}: encoding {}x{}", self.name, info.width, info.height);
                self.geometry = Some((info.width, info.height));
            }
            Some(geometry) if geometry != (info.width, info.height) => {
                return Err(anyhow!(
                    "frame size changed from {}x{} to {}x{}",
                    geometry.0,
                    geometry.1,
                    info.width,
                    info.height
                ));
            }
            Some(_) => {}
        }

        self.frames += 1;
        Ok(vec![buffer.with_keyframe(true)])
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        debug!("{}: {} frames encoded", self.name, self.frames);
        Ok(Vec::new())
    }
}
