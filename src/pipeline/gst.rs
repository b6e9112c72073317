//! GStreamer-backed graph
//!
//! Same contract as the built-in [`Graph`](super::graph::Graph), with the
//! stages supplied by GStreamer's element factories. Bus messages are
//! translated into [`Event`]s on a tokio task.

use async_trait::async_trait;
use futures_util::StreamExt;
use gstreamer as gst;
use gstreamer::prelude::*;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{Event, EventBus, EventReceiver};
use super::graph::{EosControl, GraphSettings, MediaGraph};
use super::health::PipelineHealth;
use super::stage::StageSpec;
use super::state::LifecycleState;
use crate::error::{CaptureError, ConstructionError, StateChangeError};

/// Upper bound for an asynchronous state change to complete
const STATE_CHANGE_TIMEOUT_SECS: u64 = 5;

fn to_gst(state: LifecycleState) -> gst::State {
    match state {
        LifecycleState::Null => gst::State::Null,
        LifecycleState::Ready => gst::State::Ready,
        LifecycleState::Paused => gst::State::Paused,
        LifecycleState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> Option<LifecycleState> {
    match state {
        gst::State::Null => Some(LifecycleState::Null),
        gst::State::Ready => Some(LifecycleState::Ready),
        gst::State::Paused => Some(LifecycleState::Paused),
        gst::State::Playing => Some(LifecycleState::Playing),
        _ => None,
    }
}

struct Control {
    pipeline: gst::Pipeline,
    state: AtomicU8,
    eos_requested: AtomicBool,
    eos: CancellationToken,
}

impl EosControl for Control {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn send_end_of_stream(&self) -> bool {
        if self.eos_requested.swap(true, Ordering::SeqCst) {
            debug!("{}: end-of-stream already requested", self.pipeline.name());
            return false;
        }
        info!("{}: end-of-stream requested", self.pipeline.name());
        if !self.pipeline.send_event(gst::event::Eos::new()) {
            warn!("{}: EOS event was not handled", self.pipeline.name());
        }
        self.eos.cancel();
        true
    }

    fn eos_requested(&self) -> bool {
        self.eos_requested.load(Ordering::SeqCst)
    }

    fn eos_token(&self) -> CancellationToken {
        self.eos.clone()
    }
}

/// A `gst::Pipeline` driven through the lifecycle
pub struct GstGraph {
    name: String,
    control: Arc<Control>,
    elements: Vec<gst::Element>,
    health: Arc<PipelineHealth>,
    events: Option<EventReceiver>,
    watcher: Option<JoinHandle<()>>,
    closing: CancellationToken,
}

impl GstGraph {
    /// Create, configure and link one element per spec
    pub fn build(name: &str, specs: &[StageSpec], settings: GraphSettings) -> Result<GstGraph, CaptureError> {
        gst::init().map_err(|e| CaptureError::Backend(e.to_string()))?;

        if specs.len() < 2 {
            return Err(ConstructionError::InvalidChain(format!(
                "a chain needs a source and a sink, got {} stage(s)",
                specs.len()
            ))
            .into());
        }

        let pipeline = gst::Pipeline::with_name(name);
        let mut elements = Vec::with_capacity(specs.len());
        for spec in specs {
            let element = Self::make(spec)?;
            pipeline.add(&element).map_err(|e| ConstructionError::StageCreation {
                kind: spec.kind,
                factory: spec.factory.clone(),
                reason: e.to_string(),
            })?;
            elements.push(element);
        }

        for pair in elements.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            if up.link(down).is_err() {
                let caps = |element: &gst::Element, pad: &str| {
                    element
                        .static_pad(pad)
                        .map(|p| p.query_caps(None).to_string())
                        .unwrap_or_else(|| "none".to_string())
                };
                return Err(ConstructionError::Link {
                    upstream: up.name().to_string(),
                    downstream: down.name().to_string(),
                    upstream_caps: caps(up, "src"),
                    downstream_caps: caps(down, "sink"),
                }
                .into());
            }
        }

        let health = Arc::new(PipelineHealth::new());
        if let Some(pad) = elements.last().and_then(|sink| sink.static_pad("sink")) {
            let health = Arc::clone(&health);
            pad.add_probe(gst::PadProbeType::BUFFER, move |_, info| {
                if let Some(buffer) = info.buffer() {
                    let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                    health.record_buffer(buffer.size(), keyframe);
                }
                gst::PadProbeReturn::Ok
            });
        }

        let (bus, events) = EventBus::channel(settings.event_capacity);
        let closing = CancellationToken::new();
        let watcher = pipeline
            .bus()
            .map(|gst_bus| tokio::spawn(watch_bus(pipeline.clone(), gst_bus, bus, closing.clone())));

        info!(
            "{}: built {}",
            name,
            specs.iter().map(|s| s.factory.as_str()).collect::<Vec<_>>().join(" ! ")
        );

        Ok(GstGraph {
            name: name.to_string(),
            control: Arc::new(Control {
                pipeline,
                state: AtomicU8::new(LifecycleState::Null.as_u8()),
                eos_requested: AtomicBool::new(false),
                eos: CancellationToken::new(),
            }),
            elements,
            health,
            events: Some(events),
            watcher,
            closing,
        })
    }

    fn make(spec: &StageSpec) -> Result<gst::Element, ConstructionError> {
        let creation = |reason: String| ConstructionError::StageCreation {
            kind: spec.kind,
            factory: spec.factory.clone(),
            reason,
        };

        let element = gst::ElementFactory::make(&spec.factory)
            .name(spec.instance_name())
            .build()
            .map_err(|e| creation(e.to_string()))?;

        for (key, value) in &spec.options {
            if element.find_property(key).is_none() {
                return Err(creation(format!("no property '{}'", key)));
            }
            element
                .try_set_property_from_str(key, value)
                .map_err(|e| creation(format!("property '{}' rejects {:?}: {}", key, value, e)))?;
        }
        Ok(element)
    }

    async fn step(&mut self, from: LifecycleState, to: LifecycleState) -> Result<(), StateChangeError> {
        let pipeline = self.control.pipeline.clone();
        let target = to_gst(to);
        let failed = |reason: String| StateChangeError {
            from,
            to,
            stage: None,
            reason,
        };

        // set_state and the wait below block on streaming threads
        let outcome = tokio::task::spawn_blocking(move || -> Result<(), String> {
            match pipeline.set_state(target) {
                Ok(gst::StateChangeSuccess::Async) => {
                    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
                    result.map(|_| ()).map_err(|e| e.to_string())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| failed(e.to_string()))?;

        outcome.map_err(failed)?;
        self.control.state.store(to.as_u8(), Ordering::SeqCst);
        Ok(())
    }
}

async fn watch_bus(pipeline: gst::Pipeline, gst_bus: gst::Bus, bus: EventBus, closing: CancellationToken) {
    let mut messages = gst_bus.stream();
    loop {
        let msg = tokio::select! {
            _ = closing.cancelled() => break,
            msg = messages.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let source = msg
            .src()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        match msg.view() {
            gst::MessageView::Eos(..) => {
                bus.post_terminal(Event::EndOfStream, &closing).await;
            }
            gst::MessageView::Error(err) => {
                let mut message = err.error().to_string();
                if let Some(debug) = err.debug() {
                    message = format!("{} ({})", message, debug);
                }
                error!("{}: {}", source, message);
                bus.post_terminal(Event::Error { source, message }, &closing).await;
            }
            gst::MessageView::Warning(w) => bus.post(Event::Warning {
                source,
                message: w.error().to_string(),
            }),
            gst::MessageView::StateChanged(change) => {
                if msg.src() != Some(pipeline.upcast_ref::<gst::Object>()) {
                    continue;
                }
                if let (Some(old), Some(new)) = (from_gst(change.old()), from_gst(change.current())) {
                    bus.post(Event::StateChanged { old, new });
                }
            }
            gst::MessageView::StreamStart(..) => bus.post(Event::StreamStarted { stage: source }),
            _ => {}
        }
    }
}

#[async_trait]
impl MediaGraph for GstGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LifecycleState {
        self.control.state()
    }

    fn stage_count(&self) -> usize {
        self.elements.len()
    }

    fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }

    fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    fn eos_control(&self) -> Arc<dyn EosControl> {
        self.control.clone()
    }

    async fn set_state(&mut self, target: LifecycleState) -> Result<(), StateChangeError> {
        for (from, to) in self.state().path_to(target) {
            self.step(from, to).await?;
        }
        Ok(())
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        self.closing.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if self.state() != LifecycleState::Null {
            let _ = self.control.pipeline.set_state(gst::State::Null);
        }
        for element in self.elements.drain(..) {
            let _ = self.control.pipeline.remove(&element);
        }
    }
}
