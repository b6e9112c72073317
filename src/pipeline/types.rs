//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timestamp representation for media buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Microseconds of running time since the graph started playing
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration of running time
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Raw pixel layouts understood by the built-in stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoFormat {
    Rgba,
    Bgra,
    Nv12,
    I420,
}

impl VideoFormat {
    /// Caps field value for this format
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFormat::Rgba => "RGBA",
            VideoFormat::Bgra => "BGRA",
            VideoFormat::Nv12 => "NV12",
            VideoFormat::I420 => "I420",
        }
    }

    pub fn parse(value: &str) -> Option<VideoFormat> {
        match value.to_ascii_uppercase().as_str() {
            "RGBA" => Some(VideoFormat::Rgba),
            "BGRA" => Some(VideoFormat::Bgra),
            "NV12" => Some(VideoFormat::Nv12),
            "I420" => Some(VideoFormat::I420),
            _ => None,
        }
    }

    /// Size in bytes of one frame in this layout.
    /// 4:2:0 formats need even dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            VideoFormat::Rgba | VideoFormat::Bgra => w * h * 4,
            VideoFormat::Nv12 | VideoFormat::I420 => w * h + 2 * ((w / 2) * (h / 2)),
        }
    }
}

impl std::str::FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VideoFormat::parse(s).ok_or_else(|| format!("unsupported video format '{}'", s))
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geometry of the raw or encoded picture carried by a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub format: Option<VideoFormat>,
}

/// A unit of media data travelling between stages
#[derive(Clone)]
pub struct Buffer {
    /// Payload bytes (raw pixels, RTP packet, access unit or container bytes)
    pub data: Bytes,

    /// Presentation timestamp in running time
    pub pts: Timestamp,

    /// Absolute byte offset for seekable sinks; `None` appends
    pub offset: Option<u64>,

    /// Whether this buffer can be decoded on its own
    pub is_keyframe: bool,

    /// Container or stream header rather than media data
    pub is_header: bool,

    /// Picture geometry, when the producer knows it
    pub video: Option<VideoInfo>,
}

impl Buffer {
    /// Create a new buffer with no offset and no video info
    pub fn new(data: impl Into<Bytes>, pts: Timestamp) -> Self {
        Self {
            data: data.into(),
            pts,
            offset: None,
            is_keyframe: false,
            is_header: false,
            video: None,
        }
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    pub fn with_header(mut self, is_header: bool) -> Self {
        self.is_header = is_header;
        self
    }

    pub fn with_video(mut self, video: VideoInfo) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Get the size of the buffer data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Buffer");
        debug
            .field("pts", &self.pts)
            .field("size", &self.size())
            .field("is_keyframe", &self.is_keyframe);

        if self.is_header {
            debug.field("is_header", &true);
        }
        if let Some(offset) = self.offset {
            debug.field("offset", &offset);
        }
        if let Some(video) = &self.video {
            debug.field("video", video);
        }

        debug.finish()
    }
}

/// What flows over the channel between two stage workers
#[derive(Debug)]
pub(crate) enum Item {
    Buffer(Buffer),
    Eos,
}
