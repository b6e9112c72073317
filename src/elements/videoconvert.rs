use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::stage::{Stage, StageOptions};
use crate::pipeline::types::{Buffer, VideoFormat, VideoInfo};

/// Converts raw frames to planar I420
pub struct VideoConvert {
    converted: u64,
}

impl VideoConvert {
    pub fn from_options(_options: &StageOptions) -> Result<Self> {
        Ok(Self { converted: 0 })
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// BT.601 limited-range RGB → I420, chroma from the mean of each 2x2 block.
/// `bgr` swaps the first and third channel.
pub(crate) fn packed_to_i420(src: &[u8], width: usize, height: usize, bgr: bool) -> Vec<u8> {
    let (cw, ch) = (width / 2, height / 2);
    let mut out = vec![0u8; width * height + 2 * cw * ch];
    let (y_plane, uv) = out.split_at_mut(width * height);
    let (u_plane, v_plane) = uv.split_at_mut(cw * ch);

    let rgb = |x: usize, y: usize| -> (i32, i32, i32) {
        let i = (y * width + x) * 4;
        let (a, b, c) = (src[i] as i32, src[i + 1] as i32, src[i + 2] as i32);
        if bgr { (c, b, a) } else { (a, b, c) }
    };

    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = rgb(x, y);
            y_plane[y * width + x] = luma(r, g, b);
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (pr, pg, pb) = rgb(cx * 2 + dx, cy * 2 + dy);
                r += pr;
                g += pg;
                b += pb;
            }
            let (u, v) = chroma(r / 4, g / 4, b / 4);
            u_plane[cy * cw + cx] = u;
            v_plane[cy * cw + cx] = v;
        }
    }
    out
}

/// Split the interleaved UV plane of NV12 into separate U and V planes
pub(crate) fn nv12_to_i420(src: &[u8], width: usize, height: usize) -> Vec<u8> {
    let luma_len = width * height;
    let chroma_len = (width / 2) * (height / 2);
    let mut out = Vec::with_capacity(luma_len + 2 * chroma_len);
    out.extend_from_slice(&src[..luma_len]);

    let interleaved = &src[luma_len..luma_len + 2 * chroma_len];
    out.extend(interleaved.iter().step_by(2));
    out.extend(interleaved.iter().skip(1).step_by(2));
    out
}

#[async_trait]
impl Stage for VideoConvert {
    fn pads(&self) -> Pads {
        Pads::filter(
            Caps::builder("video/x-raw")
                .one_of("format", ["RGBA", "BGRA", "NV12", "I420"])
                .build(),
            Caps::builder("video/x-raw").field("format", VideoFormat::I420).build(),
        )
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let info = buffer
            .video
            .ok_or_else(|| anyhow!("raw buffer without video info"))?;
        let format = info
            .format
            .ok_or_else(|| anyhow!("raw buffer without pixel format"))?;
        let (w, h) = (info.width as usize, info.height as usize);

        if w % 2 != 0 || h % 2 != 0 {
            bail!("cannot convert {}x{} to I420, dimensions must be even", w, h);
        }
        let expected = format.frame_size(info.width, info.height);
        if buffer.size() != expected {
            bail!(
                "{} frame of {}x{} should be {} bytes, got {}",
                format,
                w,
                h,
                expected,
                buffer.size()
            );
        }

        let data = match format {
            VideoFormat::I420 => buffer.data.clone(),
            VideoFormat::Nv12 => nv12_to_i420(&buffer.data, w, h).into(),
            VideoFormat::Rgba => packed_to_i420(&buffer.data, w, h, false).into(),
            VideoFormat::Bgra => packed_to_i420(&buffer.data, w, h, true).into(),
        };
        self.converted += 1;

        Ok(vec![Buffer {
            data,
            video: Some(VideoInfo {
                format: Some(VideoFormat::I420),
                ..info
            }),
            ..buffer
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Timestamp;

    fn frame(format: VideoFormat, data: Vec<u8>, width: u32, height: u32) -> Buffer {
        Buffer::new(data, Timestamp::ZERO).with_video(VideoInfo {
            width,
            height,
            format: Some(format),
        })
    }

    #[test]
    fn test_primary_colours() {
        // White and black
        assert_eq!(luma(255, 255, 255), 235);
        assert_eq!(luma(0, 0, 0), 16);
        assert_eq!(chroma(0, 0, 0), (128, 128));
        // Pure red has low U and high V
        let (u, v) = chroma(255, 0, 0);
        assert!(u < 128 && v > 200);
    }

    #[test]
    fn test_bgra_matches_rgba() {
        let rgba: Vec<u8> = (0..16).flat_map(|i| [i * 10, 200 - i * 5, 30, 255]).collect();
        let bgra: Vec<u8> = rgba.chunks(4).flat_map(|p| [p[2], p[1], p[0], p[3]]).collect();
        assert_eq!(packed_to_i420(&rgba, 4, 4, false), packed_to_i420(&bgra, 4, 4, true));
    }

    #[test]
    fn test_nv12_deinterleave() {
        let mut nv12 = vec![7u8; 4 * 2];
        nv12.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(nv12_to_i420(&nv12, 4, 2), vec![7, 7, 7, 7, 7, 7, 7, 7, 1, 3, 2, 4]);
    }

    #[tokio::test]
    async fn test_push_outputs_i420() {
        let mut convert = VideoConvert::from_options(&StageOptions::new()).unwrap();
        let out = convert
            .push(frame(VideoFormat::Rgba, vec![0u8; 4 * 2 * 4], 4, 2))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size(), VideoFormat::I420.frame_size(4, 2));
        assert_eq!(out[0].video.and_then(|v| v.format), Some(VideoFormat::I420));
    }

    #[tokio::test]
    async fn test_push_rejects_short_frames() {
        let mut convert = VideoConvert::from_options(&StageOptions::new()).unwrap();
        assert!(convert.push(frame(VideoFormat::Nv12, vec![0u8; 5], 4, 2)).await.is_err());
        assert!(convert.push(Buffer::new(vec![0u8; 12], Timestamp::ZERO)).await.is_err());
    }
}
