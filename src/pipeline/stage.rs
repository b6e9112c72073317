//! Pipeline stage trait and stage descriptions
//!
//! Defines the interface every processing unit implements and the
//! description used to ask the registry for one.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::caps::Pads;
use super::clock::MediaClock;
use super::health::PipelineHealth;
use super::types::Buffer;

/// Role of a stage within a capture chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Capture,
    Convert,
    Encode,
    Depayload,
    Parse,
    Mux,
    Sink,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Capture => "capture",
            StageKind::Convert => "convert",
            StageKind::Encode => "encode",
            StageKind::Depayload => "depayload",
            StageKind::Parse => "parse",
            StageKind::Mux => "mux",
            StageKind::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// Key/value options handed to a stage factory
pub type StageOptions = BTreeMap<String, String>;

/// What to instantiate at one position of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    pub factory: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: StageOptions,
}

impl StageSpec {
    pub fn new(kind: StageKind, factory: &str) -> Self {
        Self {
            kind,
            factory: factory.to_string(),
            name: None,
            options: StageOptions::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn option(mut self, key: &str, value: impl ToString) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Instance name, defaulting to the kind
    pub fn instance_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.kind.to_string())
    }
}

/// Per-run services handed to a stage when it starts
#[derive(Clone)]
pub struct StageContext {
    /// Instance name of the stage
    pub name: String,
    /// Running-time clock of the graph
    pub clock: MediaClock,
    /// Shared health counters of the graph
    pub health: Arc<PipelineHealth>,
}

/// Trait for pipeline stages that process media data
///
/// A stage without a sink pad is a source and is driven through `pull`;
/// every other stage is driven through `push`. On end-of-stream the graph
/// calls `finish` so the stage can emit whatever it still holds before EOS
/// travels further downstream.
#[async_trait]
pub trait Stage: Send {
    /// Port capabilities of this stage
    fn pads(&self) -> Pads;

    /// Acquire resources (open files, bind sockets). Called on Ready → Paused.
    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Buffers to send downstream before any input, such as a container
    /// header. Called once per activation, before the first `push`.
    async fn preroll(&mut self) -> Result<Vec<Buffer>> {
        Ok(Vec::new())
    }

    /// Produce the next buffer. `Ok(None)` ends the stream.
    async fn pull(&mut self) -> Result<Option<Buffer>> {
        Err(anyhow::anyhow!("stage is not a source"))
    }

    /// Consume one buffer and return what goes downstream
    async fn push(&mut self, _buffer: Buffer) -> Result<Vec<Buffer>> {
        Err(anyhow::anyhow!("stage does not accept input"))
    }

    /// Flush everything still buffered. Called once, before EOS is forwarded.
    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        Ok(Vec::new())
    }

    /// Release resources. Called on Paused → Ready, after the worker ended.
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Parse an option value, falling back to `default` when absent
pub fn option_or<T: std::str::FromStr>(options: &StageOptions, key: &str, default: T) -> Result<T> {
    match options.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value {:?} for option '{}'", raw, key)),
    }
}
