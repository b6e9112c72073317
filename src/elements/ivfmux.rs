//! IVF container writer
//!
//! Layout (all little endian):
//! - file header, 32 bytes: `DKIF`, version u16, header size u16, fourcc,
//!   width u16, height u16, timebase denominator u32, numerator u32,
//!   frame count u32, reserved u32
//! - per frame: size u32, pts u64, then the frame bytes
//!
//! The header goes out before the first frame with a frame count of zero,
//! so a stream that is cut off still starts with a valid header. On EOS the
//! header is sent again, addressed to offset 0, with the final values.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::{Buffer, Timestamp};

pub const IVF_HEADER_LEN: usize = 32;
pub const IVF_FRAME_HEADER_LEN: usize = 12;

/// Timestamps are written in microseconds
const TIMEBASE_DEN: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub frame_count: u32,
}

impl IvfHeader {
    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(IVF_HEADER_LEN);
        out.put_slice(b"DKIF");
        out.put_u16_le(0);
        out.put_u16_le(IVF_HEADER_LEN as u16);
        out.put_slice(&self.fourcc);
        out.put_u16_le(self.width);
        out.put_u16_le(self.height);
        out.put_u32_le(TIMEBASE_DEN);
        out.put_u32_le(1);
        out.put_u32_le(self.frame_count);
        out.put_u32_le(0);
        out
    }

    pub fn parse(data: &[u8]) -> Option<IvfHeader> {
        if data.len() < IVF_HEADER_LEN || &data[0..4] != b"DKIF" {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        if u16_at(6) as usize != IVF_HEADER_LEN {
            return None;
        }
        Some(IvfHeader {
            fourcc: [data[8], data[9], data[10], data[11]],
            width: u16_at(12),
            height: u16_at(14),
            frame_count: u32_at(24),
        })
    }
}

fn parse_fourcc(value: &str) -> Result<[u8; 4]> {
    value
        .as_bytes()
        .try_into()
        .map_err(|_| anyhow!("fourcc must be four characters, got {:?}", value))
}

pub struct IvfMux {
    header: IvfHeader,
    /// Whether the geometry came from options rather than the stream
    fixed_geometry: bool,
    name: String,
}

impl IvfMux {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let fourcc = parse_fourcc(&option_or(options, "fourcc", "H264".to_string())?)?;
        let width: u16 = option_or(options, "width", 0)?;
        let height: u16 = option_or(options, "height", 0)?;
        Ok(Self {
            header: IvfHeader {
                fourcc,
                width,
                height,
                frame_count: 0,
            },
            fixed_geometry: width > 0 && height > 0,
            name: String::new(),
        })
    }

    fn frame(&self, buffer: &Buffer) -> Result<BytesMut> {
        let size = u32::try_from(buffer.size()).map_err(|_| anyhow!("frame too large for IVF"))?;
        let mut out = BytesMut::with_capacity(IVF_FRAME_HEADER_LEN + buffer.size());
        out.put_u32_le(size);
        out.put_u64_le(buffer.pts.micros.max(0) as u64);
        out.put_slice(&buffer.data);
        Ok(out)
    }
}

#[async_trait]
impl Stage for IvfMux {
    fn pads(&self) -> Pads {
        let sink = Caps::builder("video/x-i420")
            .build()
            .merge(Caps::builder("video/x-h264").field("stream-format", "byte-stream").build());
        Pads::filter(sink, Caps::builder("video/x-ivf").build())
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        self.name = ctx.name.clone();
        self.header.frame_count = 0;
        Ok(())
    }

    async fn preroll(&mut self) -> Result<Vec<Buffer>> {
        Ok(vec![Buffer::new(self.header.to_bytes(), Timestamp::ZERO).with_header(true)])
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        if let (false, Some(video)) = (self.fixed_geometry, buffer.video) {
            match (u16::try_from(video.width), u16::try_from(video.height)) {
                (Ok(width), Ok(height)) => {
                    if (width, height) != (self.header.width, self.header.height) {
                        debug!("{}: geometry {}x{}", self.name, width, height);
                        self.header.width = width;
                        self.header.height = height;
                    }
                }
                _ => warn!(
                    "{}: {}x{} does not fit the IVF header, keeping {}x{}",
                    self.name, video.width, video.height, self.header.width, self.header.height
                ),
            }
        }

        let frame = self.frame(&buffer)?;
        self.header.frame_count += 1;
        Ok(vec![
            Buffer::new(frame, buffer.pts).with_keyframe(buffer.is_keyframe),
        ])
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        info!(
            "{}: finalizing {} frames of {}x{}",
            self.name, self.header.frame_count, self.header.width, self.header.height
        );
        Ok(vec![
            Buffer::new(self.header.to_bytes(), Timestamp::ZERO)
                .with_header(true)
                .with_offset(0),
        ])
    }
}
