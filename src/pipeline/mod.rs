//! Pipeline lifecycle layer for capline
//!
//! This module drives a chain of media stages from construction to a clean
//! teardown, separating concerns between:
//! - Construction: stage creation through a registry and caps-based linking
//! - Control: the lifecycle state machine and the controller loop
//! - Signalling: the event channel, end-of-stream and the shutdown timer
//!
//! # Architecture
//!
//! A graph runs each stage in its own async task while Paused or Playing:
//! - Stages implement the `Stage` trait
//! - Bounded channels carry buffers and EOS between neighbours
//! - The controller consumes the graph's events and owns its teardown
//! - MediaClock provides running time for live sources
//! - Health monitoring tracks what reaches the final stage

pub mod caps;
pub mod clock;
pub mod controller;
pub mod events;
pub mod graph;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod health;
pub mod stage;
pub mod state;
pub mod timer;
pub mod topology;
pub mod types;

pub use caps::{Caps, Pads};
pub use clock::MediaClock;
pub use controller::{ControllerSettings, LifecycleController, Termination};
pub use events::{Event, EventReceiver};
pub use graph::{EosControl, Graph, GraphHandle, GraphSettings, MediaGraph};
pub use health::PipelineHealth;
pub use stage::{Stage, StageContext, StageKind, StageSpec};
pub use state::LifecycleState;
pub use timer::ShutdownTimer;
pub use topology::{Backend, DeviceSource, FactoryOverrides, StreamSource, Topology};
pub use types::{Buffer, Timestamp, VideoFormat, VideoInfo};
