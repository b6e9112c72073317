use thiserror::Error;

use crate::pipeline::{LifecycleState, StageKind};

/// Failure while creating or wiring the stages of a graph
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("could not create {kind} stage '{factory}': {reason}")]
    StageCreation {
        kind: StageKind,
        factory: String,
        reason: String,
    },

    #[error("could not link '{upstream}' to '{downstream}': {upstream_caps} does not match {downstream_caps}")]
    Link {
        upstream: String,
        downstream: String,
        upstream_caps: String,
        downstream_caps: String,
    },

    #[error("invalid stage chain: {0}")]
    InvalidChain(String),
}

/// A state transition was rejected by the graph
#[derive(Debug, Error)]
#[error("state change {from} -> {to} failed{}: {reason}", .stage.as_ref().map(|s| format!(" in '{}'", s)).unwrap_or_default())]
pub struct StateChangeError {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub stage: Option<String>,
    pub reason: String,
}

/// Everything that can stop a capture run before it produces a [`Termination`]
///
/// [`Termination`]: crate::pipeline::Termination
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    StateChange(#[from] StateChangeError),

    #[error("the graph's event channel already has a consumer")]
    EventsTaken,

    #[error("this controller has already run")]
    AlreadyRun,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("media backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            CaptureError::Construction(_) => 2,
            CaptureError::StateChange(_) => 3,
            CaptureError::Config(_) => 4,
            CaptureError::EventsTaken | CaptureError::AlreadyRun | CaptureError::Backend(_) => 1,
        }
    }
}
