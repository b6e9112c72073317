use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::sync::Arc;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::{Buffer, Timestamp};

pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub(crate) const NAL_IDR: u8 = 5;
pub(crate) const NAL_SPS: u8 = 7;

const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Reassembles H.264 NAL units from RTP payloads (RFC 6184)
/// into complete Annex B access units.
pub struct H264Depacketizer {
    buffer: BytesMut,
    seen_idr: bool,
    in_fua_fragment: bool,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            seen_idr: false,
            in_fua_fragment: false,
        }
    }

    /// Drop the access unit being assembled. Unlike a full reset, the
    /// stream keeps its IDR state.
    pub fn discard_pending(&mut self) {
        self.buffer.clear();
        self.in_fua_fragment = false;
    }

    /// Reset all state. Output is withheld until the next IDR.
    pub fn reset(&mut self) {
        self.discard_pending();
        self.seen_idr = false;
    }

    /// Feed one RTP payload + marker bit.
    /// Returns `Some(access_unit)` when a complete access unit is ready.
    pub fn push(&mut self, payload: &[u8], marker: bool) -> Option<Bytes> {
        if payload.is_empty() {
            return None;
        }

        match payload[0] & 0x1F {
            1..=23 => self.push_nal(payload),
            NAL_STAP_A => {
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let nalu_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if offset + nalu_len > payload.len() {
                        warn!("STAP-A: truncated aggregation unit");
                        break;
                    }
                    self.push_nal(&payload[offset..offset + nalu_len]);
                    offset += nalu_len;
                }
            }
            NAL_FU_A => {
                if payload.len() < 2 {
                    return None;
                }
                let fu_indicator = payload[0];
                let fu_header = payload[1];
                let start = (fu_header & 0x80) != 0;
                let end = (fu_header & 0x40) != 0;

                if start {
                    if self.in_fua_fragment {
                        warn!("FU-A: new start while previous fragment incomplete, discarding buffer");
                        self.buffer.clear();
                    }
                    self.in_fua_fragment = true;
                    // NRI from the indicator, type from the FU header
                    let nal_header = (fu_indicator & 0xE0) | (fu_header & 0x1F);
                    self.buffer.put_slice(&START_CODE);
                    self.buffer.put_u8(nal_header);
                } else if !self.in_fua_fragment {
                    // Middle or end without a start: the start was lost
                    return None;
                }

                if payload.len() > 2 {
                    self.buffer.put_slice(&payload[2..]);
                }
                if end {
                    self.in_fua_fragment = false;
                }
            }
            _ => return None,
        }

        if marker {
            self.in_fua_fragment = false;
            self.drain_au()
        } else {
            None
        }
    }

    fn drain_au(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }

        let data = self.buffer.split().freeze();
        if !self.seen_idr {
            if contains_nal_type(&data, NAL_IDR) {
                self.seen_idr = true;
            } else {
                return None;
            }
        }
        Some(data)
    }

    #[inline]
    fn push_nal(&mut self, nal: &[u8]) {
        self.buffer.put_slice(&START_CODE);
        self.buffer.put_slice(nal);
    }
}

/// Scan Annex B data for a NAL unit with the given type.
pub(crate) fn contains_nal_type(data: &[u8], target_type: u8) -> bool {
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_CODE {
            if (data[i + 4] & 0x1F) == target_type {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

/// RTP → H.264 byte-stream access units
pub struct RtpH264Depay {
    payload: Option<u8>,
    clock_rate: u32,
    depacketizer: H264Depacketizer,
    next_seq: Option<u16>,
    first_rtp_ts: Option<u32>,
    health: Arc<PipelineHealth>,
    name: String,
}

impl RtpH264Depay {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let payload = match options.get("payload") {
            Some(_) => Some(option_or(options, "payload", 96u8)?),
            None => None,
        };
        let clock_rate = option_or(options, "clock-rate", 90000u32)?;
        if clock_rate == 0 {
            return Err(anyhow!("clock-rate must be positive"));
        }
        Ok(Self {
            payload,
            clock_rate,
            depacketizer: H264Depacketizer::new(),
            next_seq: None,
            first_rtp_ts: None,
            health: Arc::new(PipelineHealth::new()),
            name: String::new(),
        })
    }

    /// Running time of an RTP timestamp, relative to the first packet
    fn pts(&mut self, rtp_ts: u32) -> Timestamp {
        let first = *self.first_rtp_ts.get_or_insert(rtp_ts);
        let ticks = rtp_ts.wrapping_sub(first) as i64;
        Timestamp::from_micros(ticks * 1_000_000 / self.clock_rate as i64)
    }

    fn track_sequence(&mut self, seq: u16) {
        if let Some(expected) = self.next_seq {
            if seq != expected {
                let lost = seq.wrapping_sub(expected);
                warn!(
                    "{}: sequence gap, expected {} got {} ({} lost), dropping partial access unit",
                    self.name, expected, seq, lost
                );
                self.depacketizer.discard_pending();
                self.health.record_drop();
            }
        }
        self.next_seq = Some(seq.wrapping_add(1));
    }
}

#[async_trait]
impl Stage for RtpH264Depay {
    fn pads(&self) -> Pads {
        Pads::filter(
            Caps::builder("application/x-rtp")
                .field("media", "video")
                .field("encoding-name", "H264")
                .build(),
            Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
        )
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        self.depacketizer.reset();
        self.next_seq = None;
        self.first_rtp_ts = None;
        self.health = Arc::clone(&ctx.health);
        self.name = ctx.name.clone();
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let mut raw = &buffer.data[..];
        let packet = match Packet::unmarshal(&mut raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{}: not an RTP packet: {}", self.name, e);
                self.health.record_drop();
                return Ok(Vec::new());
            }
        };

        let header = &packet.header;
        if self.payload.is_some_and(|pt| pt != header.payload_type) {
            debug!("{}: ignoring payload type {}", self.name, header.payload_type);
            self.health.record_drop();
            return Ok(Vec::new());
        }

        self.track_sequence(header.sequence_number);
        let (marker, timestamp) = (header.marker, header.timestamp);

        match self.depacketizer.push(&packet.payload, marker) {
            Some(au) => {
                let keyframe = contains_nal_type(&au, NAL_IDR);
                let pts = self.pts(timestamp);
                Ok(vec![Buffer::new(au, pts).with_keyframe(keyframe)])
            }
            None => Ok(Vec::new()),
        }
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        // An access unit without its marker is incomplete
        self.depacketizer.discard_pending();
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::MediaClock;
    use webrtc::rtp::header::Header;
    use webrtc::util::Marshal;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1f];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
    const SLICE: &[u8] = &[0x41, 0x9a, 0x02];

    fn rtp(seq: u16, ts: u32, pt: u8, marker: bool, payload: &[u8]) -> Buffer {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: pt,
                sequence_number: seq,
                timestamp: ts,
                marker,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        };
        Buffer::new(packet.marshal().unwrap(), Timestamp::ZERO)
    }

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        nals.iter().flat_map(|n| START_CODE.iter().chain(n.iter()).copied()).collect()
    }

    fn stap_a(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0x18];
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    async fn depay() -> RtpH264Depay {
        let options: StageOptions = [("payload".to_string(), "96".to_string())].into_iter().collect();
        let mut depay = RtpH264Depay::from_options(&options).unwrap();
        let ctx = StageContext {
            name: "depayload".into(),
            clock: MediaClock::new(),
            health: Arc::new(PipelineHealth::new()),
        };
        depay.start(&ctx).await.unwrap();
        depay
    }

    #[test]
    fn test_discards_until_first_idr() {
        let mut d = H264Depacketizer::new();
        assert!(d.push(SLICE, true).is_none());
        let au = d.push(&stap_a(&[SPS, IDR]), true).unwrap();
        assert_eq!(&au[..], &annexb(&[SPS, IDR])[..]);
        assert!(d.push(SLICE, true).is_some());
    }

    #[test]
    fn test_fu_a_reassembly() {
        let mut d = H264Depacketizer::new();
        // IDR split in three fragments: NRI 3, type 5
        let indicator = 0x60 | NAL_FU_A;
        assert!(d.push(&[indicator, 0x80 | NAL_IDR, 0x88], false).is_none());
        assert!(d.push(&[indicator, NAL_IDR, 0x84], false).is_none());
        let au = d.push(&[indicator, 0x40 | NAL_IDR, 0x00], true).unwrap();
        assert_eq!(&au[..], &annexb(&[&[0x65, 0x88, 0x84, 0x00]])[..]);
    }

    #[test]
    fn test_fu_a_without_start_is_ignored() {
        let mut d = H264Depacketizer::new();
        let indicator = 0x60 | NAL_FU_A;
        assert!(d.push(&[indicator, 0x40 | NAL_IDR, 0x00], true).is_none());
    }

    #[tokio::test]
    async fn test_stage_timestamps_and_keyframes() {
        let mut depay = depay().await;
        let out = depay.push(rtp(1, 9000, 96, true, &stap_a(&[SPS, IDR]))).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_keyframe);
        assert_eq!(out[0].pts, Timestamp::ZERO);

        let out = depay.push(rtp(2, 12000, 96, true, SLICE)).await.unwrap();
        assert!(!out[0].is_keyframe);
        assert_eq!(out[0].pts, Timestamp::from_micros(33_333));
    }

    #[tokio::test]
    async fn test_wrong_payload_type_is_dropped() {
        let mut depay = depay().await;
        assert!(depay.push(rtp(1, 0, 97, true, IDR)).await.unwrap().is_empty());
        assert_eq!(depay.health.buffers_dropped(), 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_drops_partial_unit() {
        let mut depay = depay().await;
        depay.push(rtp(1, 0, 96, true, &stap_a(&[SPS, IDR]))).await.unwrap();

        // First half of a slice, then the packet after the missing one ends a unit
        assert!(depay.push(rtp(2, 3000, 96, false, SLICE)).await.unwrap().is_empty());
        let out = depay.push(rtp(4, 3000, 96, true, SLICE)).await.unwrap();
        assert_eq!(&out[0].data[..], &annexb(&[SLICE])[..]);
        assert_eq!(depay.health.buffers_dropped(), 1);
    }
}
