use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;

use super::rtph264depay::{NAL_IDR, NAL_SPS};
use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Stage, StageContext, StageOptions};
use crate::pipeline::types::{Buffer, VideoInfo};

/// Split Annex B data into NAL units (without start codes).
/// Returns `None` when the data does not begin with a start code.
pub(crate) fn split_nal_units(data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    let (first, _) = *starts.first()?;
    // Three-byte code with one leading zero is the four-byte form
    if first > 1 || (first == 1 && data[0] != 0) {
        return None;
    }

    let mut units = Vec::with_capacity(starts.len());
    for (idx, &(_, begin)) in starts.iter().enumerate() {
        let mut end = starts.get(idx + 1).map(|&(s, _)| s).unwrap_or(data.len());
        // Trailing zero belongs to the next four-byte start code
        while end > begin && data[end - 1] == 0 && idx + 1 < starts.len() {
            end -= 1;
        }
        if end > begin {
            units.push(&data[begin..end]);
        }
    }
    Some(units)
}

/// MSB-first reader over an RBSP with emulation prevention removed
struct BitReader {
    data: Vec<u8>,
    pos: usize,
}

impl BitReader {
    fn new(nal_payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(nal_payload.len());
        let mut zeros = 0;
        for &byte in nal_payload {
            if zeros >= 2 && byte == 3 {
                zeros = 0;
                continue;
            }
            zeros = if byte == 0 { zeros + 1 } else { 0 };
            data.push(byte);
        }
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..n {
            value = (value << 1) | self.bit()?;
        }
        Some(value)
    }

    fn flag(&mut self) -> Option<bool> {
        Some(self.bit()? == 1)
    }

    /// Exp-Golomb unsigned
    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        Some((1u32 << zeros) - 1 + self.bits(zeros)?)
    }

    /// Exp-Golomb signed
    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let magnitude = k.div_ceil(2) as i32;
        Some(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

/// Largest picture side accepted from an SPS, in macroblocks (level 6.2 allows 1055)
const MAX_SIDE_MBS: u32 = 1056;

/// Upper bound of num_ref_frames_in_pic_order_cnt_cycle
const MAX_POC_CYCLE: u32 = 255;

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> Option<()> {
    let (mut last, mut next) = (8i32, 8i32);
    for _ in 0..size {
        if next != 0 {
            let delta = reader.se()?;
            if !(-128..=127).contains(&delta) {
                return None;
            }
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Picture size from a sequence parameter set (NAL header included)
pub(crate) fn sps_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    let mut r = BitReader::new(sps.get(1..)?);
    let profile_idc = r.bits(8)?;
    r.bits(16)?; // constraint flags, level
    r.ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.flag()?; // separate_colour_plane_flag
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.flag()?; // qpprime_y_zero_transform_bypass_flag
        if r.flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    match r.ue()? {
        0 => {
            r.ue()?;
        }
        1 => {
            r.flag()?;
            r.se()?;
            r.se()?;
            let cycle = r.ue()?;
            if cycle > MAX_POC_CYCLE {
                return None;
            }
            for _ in 0..cycle {
                r.se()?;
            }
        }
        _ => {}
    }
    r.ue()?; // max_num_ref_frames
    r.flag()?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = r.ue()?.checked_add(1)?;
    let height_map_units = r.ue()?.checked_add(1)?;
    if width_mbs > MAX_SIDE_MBS || height_map_units > MAX_SIDE_MBS {
        return None;
    }
    let frame_mbs_only = r.flag()?;
    if !frame_mbs_only {
        r.flag()?; // mb_adaptive_frame_field_flag
    }
    r.flag()?; // direct_8x8_inference_flag

    let field_factor = 2 - frame_mbs_only as u32;
    let mut width = width_mbs.checked_mul(16)?;
    let mut height = height_map_units.checked_mul(16)?.checked_mul(field_factor)?;
    if r.flag()? {
        let (left, right, top, bottom) = (r.ue()?, r.ue()?, r.ue()?, r.ue()?);
        let (crop_x, crop_y) = match chroma_format_idc {
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };
        width = width.checked_sub(left.checked_add(right)?.checked_mul(crop_x)?)?;
        height = height.checked_sub(top.checked_add(bottom)?.checked_mul(crop_y)?)?;
    }
    Some((width, height))
}

/// Validates byte-stream access units and holds output until a decoder
/// could start: an access unit carrying both SPS and IDR.
pub struct H264Parse {
    synced: bool,
    geometry: Option<(u32, u32)>,
    health: Arc<PipelineHealth>,
    name: String,
}

impl H264Parse {
    pub fn from_options(_options: &StageOptions) -> Result<Self> {
        Ok(Self {
            synced: false,
            geometry: None,
            health: Arc::new(PipelineHealth::new()),
            name: String::new(),
        })
    }
}

#[async_trait]
impl Stage for H264Parse {
    fn pads(&self) -> Pads {
        Pads::filter(
            Caps::builder("video/x-h264").build(),
            Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .field("parsed", "true")
                .build(),
        )
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        self.synced = false;
        self.geometry = None;
        self.health = Arc::clone(&ctx.health);
        self.name = ctx.name.clone();
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let Some(units) = split_nal_units(&buffer.data) else {
            warn!("{}: {} byte buffer is not Annex B, dropping", self.name, buffer.size());
            self.health.record_drop();
            return Ok(Vec::new());
        };

        let mut has_idr = false;
        for nal in &units {
            match nal[0] & 0x1F {
                NAL_IDR => has_idr = true,
                NAL_SPS => match sps_dimensions(nal) {
                    Some(geometry) => {
                        if self.geometry != Some(geometry) {
                            info!("{}: stream is {}x{}", self.name, geometry.0, geometry.1);
                        }
                        self.geometry = Some(geometry);
                    }
                    None => warn!("{}: unreadable SPS", self.name),
                },
                _ => {}
            }
        }

        if !self.synced {
            if has_idr && self.geometry.is_some() {
                debug!("{}: synced on first keyframe", self.name);
                self.synced = true;
            } else {
                self.health.record_drop();
                return Ok(Vec::new());
            }
        }

        let mut out = buffer.with_keyframe(has_idr);
        if let Some((width, height)) = self.geometry {
            out = out.with_video(VideoInfo {
                width,
                height,
                format: None,
            });
        }
        Ok(vec![out])
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        if !self.synced {
            debug!("{}: stream ended before the first keyframe", self.name);
        }
        Ok(Vec::new())
    }
}
