//! The two capture topologies and the stage chain each one needs per backend

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::stage::{StageKind, StageSpec};
use super::types::VideoFormat;

/// Which media library supplies the stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Builtin,
    Gstreamer,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "builtin" => Ok(Backend::Builtin),
            "gstreamer" | "gst" => Ok(Backend::Gstreamer),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Builtin => write!(f, "builtin"),
            Backend::Gstreamer => write!(f, "gstreamer"),
        }
    }
}

/// Camera settings for the local-device topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceSource {
    /// Device node or raw frame file. Without one the built-in backend
    /// records a synthetic pattern and GStreamer picks the default camera.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub format: VideoFormat,
}

impl Default for DeviceSource {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            framerate: 30,
            format: VideoFormat::I420,
        }
    }
}

/// RTP receiver settings for the network-stream topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamSource {
    pub address: String,
    pub port: u16,
    pub payload: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

impl Default for StreamSource {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5000,
            payload: 96,
            encoding_name: "H264".to_string(),
            clock_rate: 90000,
        }
    }
}

impl StreamSource {
    /// RTP caps in GStreamer's textual form
    pub fn caps_string(&self) -> String {
        format!(
            "application/x-rtp, media=video, encoding-name={}, payload={}, clock-rate={}",
            self.encoding_name, self.payload, self.clock_rate
        )
    }
}

/// What is being captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    LocalDevice(DeviceSource),
    NetworkStream(StreamSource),
}

/// Per-kind factory name replacements, keyed by the kind's name
pub type FactoryOverrides = HashMap<String, String>;

fn default_camera_factory() -> &'static str {
    if cfg!(target_os = "windows") {
        "ksvideosrc"
    } else if cfg!(target_os = "macos") {
        "avfvideosrc"
    } else {
        "v4l2src"
    }
}

impl Topology {
    pub fn name(&self) -> &'static str {
        match self {
            Topology::LocalDevice(_) => "local-device",
            Topology::NetworkStream(_) => "network-stream",
        }
    }

    /// Ordered stage specs writing to `location`
    pub fn stages(&self, backend: Backend, location: &str, overrides: &FactoryOverrides) -> Vec<StageSpec> {
        let mut stages = match (self, backend) {
            (Topology::LocalDevice(dev), Backend::Builtin) => {
                let capture = match &dev.device {
                    Some(device) => StageSpec::new(StageKind::Capture, "devicesrc").option("device", device),
                    None => StageSpec::new(StageKind::Capture, "testsrc"),
                };
                vec![
                    capture
                        .option("width", dev.width)
                        .option("height", dev.height)
                        .option("framerate", dev.framerate)
                        .option("format", dev.format),
                    StageSpec::new(StageKind::Convert, "videoconvert"),
                    StageSpec::new(StageKind::Encode, "rawvideoenc"),
                    StageSpec::new(StageKind::Mux, "ivfmux").option("fourcc", "I420"),
                    StageSpec::new(StageKind::Sink, "filesink").option("location", location),
                ]
            }
            (Topology::LocalDevice(dev), Backend::Gstreamer) => {
                let factory = default_camera_factory();
                let mut capture = StageSpec::new(StageKind::Capture, factory);
                if let (Some(device), "v4l2src") = (&dev.device, factory) {
                    capture = capture.option("device", device);
                }
                vec![
                    capture,
                    StageSpec::new(StageKind::Convert, "videoconvert"),
                    StageSpec::new(StageKind::Encode, "x264enc"),
                    StageSpec::new(StageKind::Mux, "mp4mux"),
                    StageSpec::new(StageKind::Sink, "filesink").option("location", location),
                ]
            }
            (Topology::NetworkStream(net), Backend::Builtin) => vec![
                StageSpec::new(StageKind::Capture, "udpsrc")
                    .option("address", &net.address)
                    .option("port", net.port)
                    .option("media", "video")
                    .option("encoding-name", &net.encoding_name)
                    .option("payload", net.payload)
                    .option("clock-rate", net.clock_rate),
                StageSpec::new(StageKind::Depayload, "rtph264depay").option("payload", net.payload),
                StageSpec::new(StageKind::Parse, "h264parse"),
                StageSpec::new(StageKind::Mux, "ivfmux").option("fourcc", "H264"),
                StageSpec::new(StageKind::Sink, "filesink").option("location", location),
            ],
            (Topology::NetworkStream(net), Backend::Gstreamer) => vec![
                StageSpec::new(StageKind::Capture, "udpsrc")
                    .option("address", &net.address)
                    .option("port", net.port)
                    .option("caps", net.caps_string()),
                StageSpec::new(StageKind::Depayload, "rtph264depay"),
                StageSpec::new(StageKind::Parse, "h264parse"),
                StageSpec::new(StageKind::Mux, "mp4mux"),
                StageSpec::new(StageKind::Sink, "filesink").option("location", location),
            ],
        };

        for spec in &mut stages {
            if let Some(factory) = overrides.get(&spec.kind.to_string()) {
                spec.factory = factory.clone();
            }
        }
        stages
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
