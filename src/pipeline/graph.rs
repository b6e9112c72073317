//! Built-in pipeline graph
//!
//! Owns an ordered chain of stages, links them by caps and runs each one on
//! its own tokio task while the graph is Paused or Playing. Stages talk over
//! bounded channels, so end-of-stream reaches the last stage only after every
//! buffer queued in front of it has been pushed through.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::caps::Pads;
use super::clock::MediaClock;
use super::events::{Event, EventBus, EventReceiver};
use super::health::PipelineHealth;
use super::stage::{Stage, StageContext, StageKind, StageSpec};
use super::state::LifecycleState;
use super::types::Item;
use crate::elements::Registry;
use crate::error::{ConstructionError, StateChangeError};

/// Thread-safe control surface for requesting end-of-stream
///
/// This is what the shutdown timer and the stop signal hold on to; it never
/// owns stages.
pub trait EosControl: Send + Sync {
    /// Current lifecycle state of the graph
    fn state(&self) -> LifecycleState;

    /// Ask the graph to stop gracefully. Only the first call has an effect;
    /// it returns `true`, every later call returns `false`.
    fn send_end_of_stream(&self) -> bool;

    /// Whether end-of-stream has been requested
    fn eos_requested(&self) -> bool;

    /// Token cancelled once end-of-stream has been requested
    fn eos_token(&self) -> CancellationToken;
}

/// A capture graph the lifecycle controller can drive
#[async_trait]
pub trait MediaGraph: Send {
    fn name(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> LifecycleState;

    /// Number of stages still owned by the graph
    fn stage_count(&self) -> usize;

    /// Health counters of this graph
    fn health(&self) -> Arc<PipelineHealth>;

    /// Take the single receiving end of the event channel
    fn take_events(&mut self) -> Option<EventReceiver>;

    /// Shareable end-of-stream control
    fn eos_control(&self) -> Arc<dyn EosControl>;

    /// Step the graph to `target` through every intermediate state
    async fn set_state(&mut self, target: LifecycleState) -> Result<(), StateChangeError>;

    fn send_end_of_stream(&self) -> bool {
        self.eos_control().send_end_of_stream()
    }
}

/// Tunables for a built-in graph
#[derive(Debug, Clone, Copy)]
pub struct GraphSettings {
    /// Capacity of the event channel
    pub event_capacity: usize,
    /// Capacity of each stage-to-stage channel
    pub queue_capacity: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            event_capacity: 32,
            queue_capacity: 16,
        }
    }
}

struct Shared {
    name: String,
    state: AtomicU8,
    eos_requested: AtomicBool,
    eos: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Cloneable handle onto a [`Graph`]'s state and end-of-stream latch
#[derive(Clone)]
pub struct GraphHandle {
    shared: Arc<Shared>,
}

impl EosControl for GraphHandle {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn send_end_of_stream(&self) -> bool {
        if self.shared.eos_requested.swap(true, Ordering::SeqCst) {
            debug!("{}: end-of-stream already requested", self.shared.name);
            return false;
        }
        info!("{}: end-of-stream requested", self.shared.name);
        self.shared.eos.cancel();
        true
    }

    fn eos_requested(&self) -> bool {
        self.shared.eos_requested.load(Ordering::SeqCst)
    }

    fn eos_token(&self) -> CancellationToken {
        self.shared.eos.clone()
    }
}

struct Slot {
    name: String,
    kind: StageKind,
    pads: Pads,
    stage: Option<Box<dyn Stage>>,
}

/// Per-activation state, alive between Ready → Paused and Paused → Ready
struct Running {
    clock: MediaClock,
    flushing: CancellationToken,
    flowing: watch::Sender<bool>,
    workers: Vec<JoinHandle<Box<dyn Stage>>>,
}

/// A linear chain of stages
pub struct Graph {
    slots: Vec<Slot>,
    shared: Arc<Shared>,
    bus: EventBus,
    events: Option<EventReceiver>,
    health: Arc<PipelineHealth>,
    settings: GraphSettings,
    running: Option<Running>,
}

impl Graph {
    /// Instantiate and link `specs` in order with default settings
    pub fn build(name: &str, specs: &[StageSpec], registry: &Registry) -> Result<Graph, ConstructionError> {
        Self::build_with(name, specs, registry, GraphSettings::default())
    }

    /// Instantiate and link `specs` in order
    pub fn build_with(
        name: &str,
        specs: &[StageSpec],
        registry: &Registry,
        settings: GraphSettings,
    ) -> Result<Graph, ConstructionError> {
        if specs.len() < 2 {
            return Err(ConstructionError::InvalidChain(format!(
                "a chain needs a source and a sink, got {} stage(s)",
                specs.len()
            )));
        }

        let mut slots = Vec::with_capacity(specs.len());
        let mut names = HashSet::new();
        for (idx, spec) in specs.iter().enumerate() {
            let stage = registry.create(spec)?;
            let mut name = spec.instance_name();
            if !names.insert(name.clone()) {
                name = format!("{}{}", name, idx);
                names.insert(name.clone());
            }
            debug!("{}: created {} stage '{}' ({})", name, spec.kind, spec.factory, name);
            slots.push(Slot {
                name,
                kind: spec.kind,
                pads: stage.pads(),
                stage: Some(stage),
            });
        }

        Self::check_shape(&slots)?;
        Self::link(&slots)?;

        let (bus, events) = EventBus::channel(settings.event_capacity);
        info!(
            "{}: built {}",
            name,
            slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(" ! ")
        );

        Ok(Graph {
            slots,
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: AtomicU8::new(LifecycleState::Null.as_u8()),
                eos_requested: AtomicBool::new(false),
                eos: CancellationToken::new(),
            }),
            bus,
            events: Some(events),
            health: Arc::new(PipelineHealth::new()),
            settings,
            running: None,
        })
    }

    /// First stage must be a source, last a sink, everything else both
    fn check_shape(slots: &[Slot]) -> Result<(), ConstructionError> {
        let last = slots.len() - 1;
        for (idx, slot) in slots.iter().enumerate() {
            let has_sink = slot.pads.sink.is_some();
            let has_src = slot.pads.src.is_some();
            let problem = match (idx == 0, idx == last) {
                (true, _) if has_sink => Some("the first stage must be a source"),
                (_, true) if has_src => Some("the last stage must be a sink"),
                (false, false) if !(has_sink && has_src) => Some("a middle stage needs input and output"),
                _ if !has_sink && !has_src => Some("stage has no ports"),
                _ => None,
            };
            if let Some(problem) = problem {
                return Err(ConstructionError::InvalidChain(format!(
                    "{} ('{}' is a {} stage)",
                    problem, slot.name, slot.kind
                )));
            }
        }
        Ok(())
    }

    fn link(slots: &[Slot]) -> Result<(), ConstructionError> {
        for pair in slots.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            let (Some(src), Some(sink)) = (&up.pads.src, &down.pads.sink) else {
                return Err(ConstructionError::InvalidChain(format!(
                    "'{}' cannot feed '{}'",
                    up.name, down.name
                )));
            };
            if !src.can_intersect(sink) {
                return Err(ConstructionError::Link {
                    upstream: up.name.clone(),
                    downstream: down.name.clone(),
                    upstream_caps: src.to_string(),
                    downstream_caps: sink.to_string(),
                });
            }
            debug!("linked {} -> {}", up.name, down.name);
        }
        Ok(())
    }

    /// Cloneable handle for cross-thread control
    pub fn handle(&self) -> GraphHandle {
        GraphHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stage instance names in chain order
    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    fn current(&self) -> LifecycleState {
        LifecycleState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    async fn step(&mut self, from: LifecycleState, to: LifecycleState) -> Result<(), StateChangeError> {
        use LifecycleState::*;

        match (from, to) {
            (Null, Ready) => self.check_owned(from, to)?,
            (Ready, Paused) => self.activate().await?,
            (Paused, Playing) => {
                if let Some(running) = &self.running {
                    running.clock.start();
                    running.flowing.send_replace(true);
                }
            }
            (Playing, Paused) => {
                if let Some(running) = &self.running {
                    running.flowing.send_replace(false);
                }
            }
            (Paused, Ready) => self.deactivate().await,
            (Ready, Null) => {}
            _ => {
                return Err(StateChangeError {
                    from,
                    to,
                    stage: None,
                    reason: "not an adjacent state".into(),
                });
            }
        }

        self.shared.set_state(to);
        debug!("{}: {} -> {}", self.shared.name, from, to);
        self.bus.post(Event::StateChanged { old: from, new: to });
        Ok(())
    }

    fn check_owned(&self, from: LifecycleState, to: LifecycleState) -> Result<(), StateChangeError> {
        match self.slots.iter().find(|s| s.stage.is_none()) {
            Some(slot) => Err(StateChangeError {
                from,
                to,
                stage: Some(slot.name.clone()),
                reason: "stage was lost".into(),
            }),
            None => Ok(()),
        }
    }

    /// Ready → Paused: start every stage (sink first) and spawn the workers
    async fn activate(&mut self) -> Result<(), StateChangeError> {
        let (from, to) = (LifecycleState::Ready, LifecycleState::Paused);
        self.check_owned(from, to)?;

        let clock = MediaClock::new();
        let flushing = CancellationToken::new();
        let (flowing, flowing_rx) = watch::channel(false);

        let mut started: Vec<usize> = Vec::new();
        for idx in (0..self.slots.len()).rev() {
            let slot = &mut self.slots[idx];
            let ctx = StageContext {
                name: slot.name.clone(),
                clock: clock.clone(),
                health: Arc::clone(&self.health),
            };
            let Some(stage) = slot.stage.as_mut() else {
                continue;
            };
            if let Err(e) = stage.start(&ctx).await {
                let name = slot.name.clone();
                error!("{}: failed to start: {:#}", name, e);
                for &done in &started {
                    if let Some(stage) = self.slots[done].stage.as_mut() {
                        if let Err(e) = stage.stop().await {
                            warn!("{}: stop after failed start: {:#}", self.slots[done].name, e);
                        }
                    }
                }
                return Err(StateChangeError {
                    from,
                    to,
                    stage: Some(name),
                    reason: format!("{:#}", e),
                });
            }
            started.push(idx);
        }

        let count = self.slots.len();
        let mut workers = Vec::with_capacity(count);
        let mut upstream: Option<mpsc::Receiver<Item>> = None;
        for idx in 0..count {
            let slot = &mut self.slots[idx];
            let Some(stage) = slot.stage.take() else {
                continue;
            };
            let (tx, next) = if idx + 1 < count {
                let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            let worker = Worker {
                name: slot.name.clone(),
                bus: self.bus.clone(),
                flushing: flushing.clone(),
                eos: self.shared.eos.clone(),
                flowing: flowing_rx.clone(),
                health: Arc::clone(&self.health),
            };
            let handle = match (upstream.take(), tx) {
                (None, Some(tx)) => tokio::spawn(worker.run_source(stage, tx)),
                (Some(rx), tx) => tokio::spawn(worker.run_stage(stage, rx, tx)),
                (None, None) => {
                    slot.stage = Some(stage);
                    return Err(StateChangeError {
                        from,
                        to,
                        stage: Some(slot.name.clone()),
                        reason: "stage is not linked".into(),
                    });
                }
            };
            workers.push(handle);
            upstream = next;
        }

        self.running = Some(Running {
            clock,
            flushing,
            flowing,
            workers,
        });
        Ok(())
    }

    /// Paused → Ready: flush the workers, take the stages back and stop them
    async fn deactivate(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.flushing.cancel();
        running.flowing.send_replace(false);

        for (idx, worker) in running.workers.into_iter().enumerate() {
            match worker.await {
                Ok(stage) => self.slots[idx].stage = Some(stage),
                Err(e) => error!("{}: worker ended abnormally: {}", self.slots[idx].name, e),
            }
        }

        for slot in self.slots.iter_mut().rev() {
            if let Some(stage) = slot.stage.as_mut() {
                if let Err(e) = stage.stop().await {
                    warn!("{}: failed to stop cleanly: {:#}", slot.name, e);
                    self.bus.post(Event::Warning {
                        source: slot.name.clone(),
                        message: format!("{:#}", e),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl MediaGraph for Graph {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn state(&self) -> LifecycleState {
        self.current()
    }

    fn stage_count(&self) -> usize {
        self.slots.len()
    }

    fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }

    fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    fn eos_control(&self) -> Arc<dyn EosControl> {
        Arc::new(self.handle())
    }

    async fn set_state(&mut self, target: LifecycleState) -> Result<(), StateChangeError> {
        for (from, to) in self.current().path_to(target) {
            self.step(from, to).await?;
        }
        Ok(())
    }

    fn send_end_of_stream(&self) -> bool {
        self.handle().send_end_of_stream()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("{}: dropped while {}, flushing workers", self.shared.name, self.current());
            running.flushing.cancel();
        }
    }
}

enum Step<T> {
    Flush,
    Eos,
    Done(T),
}

/// Everything a stage worker needs besides the stage itself
struct Worker {
    name: String,
    bus: EventBus,
    flushing: CancellationToken,
    eos: CancellationToken,
    flowing: watch::Receiver<bool>,
    health: Arc<PipelineHealth>,
}

impl Worker {
    async fn forward(&self, tx: &mpsc::Sender<Item>, item: Item) -> bool {
        tokio::select! {
            biased;
            _ = self.flushing.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        }
    }

    async fn fail(&self, err: anyhow::Error) {
        error!("{}: {:#}", self.name, err);
        let event = Event::Error {
            source: self.name.clone(),
            message: format!("{:#}", err),
        };
        self.bus.post_terminal(event, &self.flushing).await;
    }

    /// Wait until the graph is Playing. Returns the reason if it never gets there.
    async fn wait_flowing(&mut self) -> Step<()> {
        loop {
            if *self.flowing.borrow_and_update() {
                return Step::Done(());
            }
            tokio::select! {
                biased;
                _ = self.flushing.cancelled() => return Step::Flush,
                _ = self.eos.cancelled() => return Step::Eos,
                changed = self.flowing.changed() => {
                    if changed.is_err() {
                        return Step::Flush;
                    }
                }
            }
        }
    }

    async fn run_source(mut self, mut stage: Box<dyn Stage>, tx: mpsc::Sender<Item>) -> Box<dyn Stage> {
        let mut produced = 0u64;
        loop {
            match self.wait_flowing().await {
                Step::Flush => return stage,
                Step::Eos => break,
                Step::Done(()) => {}
            }

            let step = tokio::select! {
                biased;
                _ = self.flushing.cancelled() => Step::Flush,
                _ = self.eos.cancelled() => Step::Eos,
                pulled = stage.pull() => Step::Done(pulled),
            };

            match step {
                Step::Flush => return stage,
                Step::Eos => break,
                Step::Done(Ok(Some(buffer))) => {
                    if produced == 0 {
                        self.bus.post(Event::StreamStarted {
                            stage: self.name.clone(),
                        });
                    }
                    produced += 1;
                    if !self.forward(&tx, Item::Buffer(buffer)).await {
                        return stage;
                    }
                }
                Step::Done(Ok(None)) => {
                    info!("{}: stream ended after {} buffers", self.name, produced);
                    break;
                }
                Step::Done(Err(e)) => {
                    self.fail(e).await;
                    return stage;
                }
            }
        }

        debug!("{}: sending EOS downstream after {} buffers", self.name, produced);
        self.forward(&tx, Item::Eos).await;
        stage
    }

    async fn run_stage(
        self,
        mut stage: Box<dyn Stage>,
        mut rx: mpsc::Receiver<Item>,
        tx: Option<mpsc::Sender<Item>>,
    ) -> Box<dyn Stage> {
        let step = tokio::select! {
            biased;
            _ = self.flushing.cancelled() => Step::Flush,
            prerolled = stage.preroll() => Step::Done(prerolled),
        };
        match step {
            Step::Done(Ok(buffers)) => {
                if let Some(tx) = &tx {
                    for buffer in buffers {
                        if !self.forward(tx, Item::Buffer(buffer)).await {
                            return stage;
                        }
                    }
                }
            }
            Step::Done(Err(e)) => {
                self.fail(e).await;
                return stage;
            }
            _ => return stage,
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = self.flushing.cancelled() => return stage,
                item = rx.recv() => item,
            };

            let (result, at_eos) = match item {
                // Upstream went away without EOS (error or flush)
                None => return stage,
                Some(Item::Buffer(buffer)) => {
                    if tx.is_none() && !buffer.is_header {
                        self.health.record_buffer(buffer.size(), buffer.is_keyframe);
                    }
                    let step = tokio::select! {
                        biased;
                        _ = self.flushing.cancelled() => Step::Flush,
                        pushed = stage.push(buffer) => Step::Done(pushed),
                    };
                    match step {
                        Step::Done(result) => (result, false),
                        _ => return stage,
                    }
                }
                Some(Item::Eos) => {
                    debug!("{}: EOS received, draining", self.name);
                    let step = tokio::select! {
                        biased;
                        _ = self.flushing.cancelled() => Step::Flush,
                        finished = stage.finish() => Step::Done(finished),
                    };
                    match step {
                        Step::Done(result) => (result, true),
                        _ => return stage,
                    }
                }
            };

            let outputs = match result {
                Ok(outputs) => outputs,
                Err(e) => {
                    self.fail(e).await;
                    return stage;
                }
            };

            if let Some(tx) = &tx {
                for buffer in outputs {
                    if !self.forward(tx, Item::Buffer(buffer)).await {
                        return stage;
                    }
                }
            }

            if at_eos {
                match &tx {
                    Some(tx) => {
                        self.forward(tx, Item::Eos).await;
                    }
                    None => {
                        info!("{}: finalized, posting EOS", self.name);
                        self.bus
                            .post_terminal(Event::EndOfStream, &self.flushing)
                            .await;
                    }
                }
                return stage;
            }
        }
    }
}
