use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CaptureError;
use crate::pipeline::{Backend, ControllerSettings, DeviceSource, FactoryOverrides, StreamSource, Topology};

/// Placeholder in the output template replaced by the start time
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Format used to render [`TIMESTAMP_PLACEHOLDER`]
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Which topology the run captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Selector {
    #[default]
    None,
    Webcam,
    Rtp,
}

/// Run configuration, read from a JSON file and then adjusted from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub source: Selector,
    pub backend: Backend,
    /// Output path; may contain `{timestamp}`
    pub output: String,
    /// Recording length in seconds, 0 records until interrupted
    pub duration_secs: u64,
    pub eos_timeout_ms: u64,
    pub health_interval_secs: u64,
    pub event_capacity: usize,
    pub device: DeviceSource,
    pub stream: StreamSource,
    /// Factory replacements keyed by stage kind, e.g. `"encode": "openh264enc"`
    pub factories: FactoryOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: Selector::None,
            backend: Backend::Builtin,
            output: format!("capture-{}", TIMESTAMP_PLACEHOLDER),
            duration_secs: 10,
            eos_timeout_ms: 5000,
            health_interval_secs: 5,
            event_capacity: 32,
            device: DeviceSource::default(),
            stream: StreamSource::default(),
            factories: FactoryOverrides::new(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Config, CaptureError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text).map_err(|e| match e {
            CaptureError::Config(msg) => CaptureError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Config, CaptureError> {
        let config: Config = serde_json::from_str(text).map_err(|e| CaptureError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.output.trim().is_empty() {
            return Err(CaptureError::Config("output path is empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(CaptureError::Config("event-capacity must be at least 1".into()));
        }
        if self.device.width == 0 || self.device.height == 0 || self.device.framerate == 0 {
            return Err(CaptureError::Config(format!(
                "invalid device geometry {}x{}@{}",
                self.device.width, self.device.height, self.device.framerate
            )));
        }
        if self.stream.payload > 127 {
            return Err(CaptureError::Config(format!(
                "RTP payload type {} is outside 0..=127",
                self.stream.payload
            )));
        }
        Ok(())
    }

    pub fn topology(&self) -> Option<Topology> {
        match self.source {
            Selector::None => None,
            Selector::Webcam => Some(Topology::LocalDevice(self.device.clone())),
            Selector::Rtp => Some(Topology::NetworkStream(self.stream.clone())),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            deadline: self.deadline(),
            eos_timeout: Duration::from_millis(self.eos_timeout_ms),
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            ..ControllerSettings::default()
        }
    }

    /// Resolve the output template, adding the container extension when
    /// the template has none
    pub fn output_path(&self, now: chrono::DateTime<chrono::Local>, extension: &str) -> PathBuf {
        let rendered = self
            .output
            .replace(TIMESTAMP_PLACEHOLDER, &now.format(TIMESTAMP_FORMAT).to_string());
        let mut path = PathBuf::from(rendered);
        if path.extension().is_none() {
            path.set_extension(extension);
        }
        path
    }
}

/// Container extension produced by a backend
pub fn extension_for(backend: Backend) -> &'static str {
    match backend {
        Backend::Builtin => "ivf",
        Backend::Gstreamer => "mp4",
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
