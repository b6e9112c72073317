//! Built-in stage library and the factory registry the graph builds from

pub mod devicesrc;
pub mod filesink;
pub mod h264parse;
pub mod ivfmux;
pub mod rawvideoenc;
pub mod rtph264depay;
pub mod testsrc;
pub mod udpsrc;
pub mod videoconvert;

#[cfg(test)]
pub mod testing;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConstructionError;
use crate::pipeline::stage::{Stage, StageOptions, StageSpec};

type Factory = Arc<dyn Fn(&StageOptions) -> Result<Box<dyn Stage>> + Send + Sync>;

/// Factory-by-name table
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in stage
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("testsrc", |o| Ok(Box::new(testsrc::TestSrc::from_options(o)?)));
        registry.register("devicesrc", |o| Ok(Box::new(devicesrc::DeviceSrc::from_options(o)?)));
        registry.register("videoconvert", |o| {
            Ok(Box::new(videoconvert::VideoConvert::from_options(o)?))
        });
        registry.register("rawvideoenc", |o| {
            Ok(Box::new(rawvideoenc::RawVideoEnc::from_options(o)?))
        });
        registry.register("udpsrc", |o| Ok(Box::new(udpsrc::UdpSrc::from_options(o)?)));
        registry.register("rtph264depay", |o| {
            Ok(Box::new(rtph264depay::RtpH264Depay::from_options(o)?))
        });
        registry.register("h264parse", |o| Ok(Box::new(h264parse::H264Parse::from_options(o)?)));
        registry.register("ivfmux", |o| Ok(Box::new(ivfmux::IvfMux::from_options(o)?)));
        registry.register("filesink", |o| Ok(Box::new(filesink::FileSink::from_options(o)?)));
        registry
    }

    /// Add or replace a factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StageOptions) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered factory names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the stage described by `spec`
    pub fn create(&self, spec: &StageSpec) -> Result<Box<dyn Stage>, ConstructionError> {
        let factory = self
            .factories
            .get(&spec.factory)
            .ok_or_else(|| ConstructionError::StageCreation {
                kind: spec.kind,
                factory: spec.factory.clone(),
                reason: "no such stage factory".into(),
            })?;

        factory(&spec.options).map_err(|e| ConstructionError::StageCreation {
            kind: spec.kind,
            factory: spec.factory.clone(),
            reason: format!("{:#}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageKind;

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins();
        for name in [
            "testsrc",
            "devicesrc",
            "videoconvert",
            "rawvideoenc",
            "udpsrc",
            "rtph264depay",
            "h264parse",
            "ivfmux",
            "filesink",
        ] {
            assert!(registry.contains(name), "{} missing", name);
        }
    }

    #[test]
    fn test_unknown_factory() {
        let spec = StageSpec::new(StageKind::Encode, "x264enc");
        let err = Registry::with_builtins().create(&spec).err().unwrap();
        assert!(matches!(err, ConstructionError::StageCreation { ref factory, .. } if factory == "x264enc"));
    }

    #[test]
    fn test_rejected_options_are_stage_creation_errors() {
        let spec = StageSpec::new(StageKind::Capture, "testsrc").option("width", "wide");
        let err = Registry::with_builtins().create(&spec).err().unwrap();
        match err {
            ConstructionError::StageCreation { reason, .. } => assert!(reason.contains("width")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
