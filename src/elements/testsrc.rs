use anyhow::{Result, bail};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::clock::MediaClock;
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::{Buffer, VideoFormat, VideoInfo};

/// Caps of raw video with a known geometry
pub(crate) fn raw_video_caps(format: VideoFormat, width: u32, height: u32, framerate: u32) -> Caps {
    Caps::builder("video/x-raw")
        .field("format", format)
        .field("width", width)
        .field("height", height)
        .field("framerate", format!("{}/1", framerate))
        .build()
}

pub(crate) fn check_geometry(format: VideoFormat, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("invalid frame size {}x{}", width, height);
    }
    if matches!(format, VideoFormat::Nv12 | VideoFormat::I420) && (width % 2 != 0 || height % 2 != 0) {
        bail!("{} needs even dimensions, got {}x{}", format, width, height);
    }
    Ok(())
}

/// Live synthetic source: a diagonal gradient that moves one step per frame
pub struct TestSrc {
    format: VideoFormat,
    width: u32,
    height: u32,
    framerate: u32,
    /// 0 runs forever
    num_buffers: u64,
    produced: u64,
    clock: MediaClock,
}

impl TestSrc {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let format = option_or(options, "format", VideoFormat::I420)?;
        let width = option_or(options, "width", 320)?;
        let height = option_or(options, "height", 240)?;
        check_geometry(format, width, height)?;

        Ok(Self {
            format,
            width,
            height,
            framerate: option_or(options, "framerate", 30u32)?.max(1),
            num_buffers: option_or(options, "num-buffers", 0)?,
            produced: 0,
            clock: MediaClock::new(),
        })
    }

    fn info(&self) -> VideoInfo {
        VideoInfo {
            width: self.width,
            height: self.height,
            format: Some(self.format),
        }
    }
}

/// Fill one frame of the moving gradient
pub(crate) fn gradient_frame(format: VideoFormat, width: u32, height: u32, index: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let shift = (index % 256) as usize;
    let mut data = Vec::with_capacity(format.frame_size(width, height));

    match format {
        VideoFormat::Rgba | VideoFormat::Bgra => {
            for y in 0..h {
                for x in 0..w {
                    let r = ((x + shift) & 0xff) as u8;
                    let g = ((y + shift) & 0xff) as u8;
                    let b = (((x + y) / 2) & 0xff) as u8;
                    if format == VideoFormat::Rgba {
                        data.extend_from_slice(&[r, g, b, 0xff]);
                    } else {
                        data.extend_from_slice(&[b, g, r, 0xff]);
                    }
                }
            }
        }
        VideoFormat::I420 | VideoFormat::Nv12 => {
            for y in 0..h {
                for x in 0..w {
                    data.push(((x + y + shift) & 0xff) as u8);
                }
            }
            let (cw, ch) = (w / 2, h / 2);
            if format == VideoFormat::I420 {
                data.extend(std::iter::repeat_n(((shift * 2) & 0xff) as u8, cw * ch));
                data.extend(std::iter::repeat_n(128u8, cw * ch));
            } else {
                for _ in 0..cw * ch {
                    data.extend_from_slice(&[((shift * 2) & 0xff) as u8, 128]);
                }
            }
        }
    }
    data
}

#[async_trait]
impl Stage for TestSrc {
    fn pads(&self) -> Pads {
        Pads::source(raw_video_caps(self.format, self.width, self.height, self.framerate))
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        self.clock = ctx.clock.clone();
        self.produced = 0;
        debug!(
            "{}: {}x{} {} at {} fps",
            ctx.name, self.width, self.height, self.format, self.framerate
        );
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<Buffer>> {
        if self.num_buffers > 0 && self.produced >= self.num_buffers {
            return Ok(None);
        }

        let pts = MediaClock::frame_timestamp(self.produced, self.framerate);
        let wait = pts.as_duration().saturating_sub(self.clock.running_time());
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }

        let data = gradient_frame(self.format, self.width, self.height, self.produced);
        self.produced += 1;
        Ok(Some(
            Buffer::new(data, pts)
                .with_keyframe(true)
                .with_video(self.info()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::health::PipelineHealth;
    use crate::pipeline::types::Timestamp;
    use std::sync::Arc;

    fn options(pairs: &[(&str, &str)]) -> StageOptions {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_frame_sizes_match_format() {
        for format in [VideoFormat::Rgba, VideoFormat::Bgra, VideoFormat::Nv12, VideoFormat::I420] {
            assert_eq!(gradient_frame(format, 8, 4, 3).len(), format.frame_size(8, 4));
        }
    }

    #[test]
    fn test_rejects_odd_yuv_geometry() {
        assert!(TestSrc::from_options(&options(&[("width", "15")])).is_err());
        assert!(TestSrc::from_options(&options(&[("width", "15"), ("format", "RGBA")])).is_ok());
    }

    #[tokio::test]
    async fn test_finite_run_is_timestamped_by_framerate() {
        let mut src = TestSrc::from_options(&options(&[
            ("width", "4"),
            ("height", "2"),
            ("framerate", "100"),
            ("num-buffers", "3"),
        ]))
        .unwrap();
        let clock = MediaClock::new();
        let ctx = StageContext {
            name: "capture".into(),
            clock: clock.clone(),
            health: Arc::new(PipelineHealth::new()),
        };
        src.start(&ctx).await.unwrap();
        clock.start();

        let mut pts = Vec::new();
        while let Some(buffer) = src.pull().await.unwrap() {
            assert_eq!(buffer.size(), 12);
            pts.push(buffer.pts);
        }
        assert_eq!(
            pts,
            vec![
                Timestamp::from_micros(0),
                Timestamp::from_micros(10_000),
                Timestamp::from_micros(20_000)
            ]
        );
    }
}
