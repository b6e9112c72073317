//! Lifecycle controller
//!
//! Drives one graph from Null to Playing, watches its event channel until
//! the run ends one way or another, then always tears the graph down to
//! Null and releases it.

use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::Event;
use super::graph::MediaGraph;
use super::health::HealthSummary;
use super::state::LifecycleState;
use super::timer::ShutdownTimer;
use crate::error::CaptureError;
use crate::utils::sos::SignalOfStop;

/// How a controller run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The sink finalized after end-of-stream
    EndOfStream,
    /// Stopped from outside without waiting for end-of-stream
    Cancelled,
    /// A stage failed
    Error(String),
    /// End-of-stream was requested but never completed in time
    EosTimeout,
}

impl Termination {
    /// Whether the output is expected to be complete
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::EndOfStream | Termination::Cancelled)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::EndOfStream => write!(f, "end of stream"),
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::Error(message) => write!(f, "error: {}", message),
            Termination::EosTimeout => write!(f, "timed out waiting for end of stream"),
        }
    }
}

/// Timing knobs of a controller run
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Request end-of-stream after this long; `None` runs until stopped
    pub deadline: Option<Duration>,
    /// How long to wait for end-of-stream once it has been requested
    pub eos_timeout: Duration,
    /// Period of the health log line
    pub health_interval: Duration,
    /// Warn when nothing reached the sink for this long
    pub stall_threshold: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            deadline: None,
            eos_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs a graph exactly once
pub struct LifecycleController<G: MediaGraph> {
    graph: Option<G>,
    settings: ControllerSettings,
    stop: SignalOfStop,
    summary: Option<HealthSummary>,
}

impl<G: MediaGraph> LifecycleController<G> {
    pub fn new(graph: G, settings: ControllerSettings, stop: SignalOfStop) -> Self {
        Self {
            graph: Some(graph),
            settings,
            stop,
            summary: None,
        }
    }

    /// Stages still referenced through this controller
    pub fn live_stages(&self) -> usize {
        self.graph.as_ref().map(|g| g.stage_count()).unwrap_or(0)
    }

    /// The graph, until `run` has consumed it
    pub fn graph(&self) -> Option<&G> {
        self.graph.as_ref()
    }

    /// Health counters as they were at teardown
    pub fn summary(&self) -> Option<&HealthSummary> {
        self.summary.as_ref()
    }

    /// Run the graph to completion and tear it down
    pub async fn run(&mut self) -> Result<Termination, CaptureError> {
        let Some(mut graph) = self.graph.take() else {
            return Err(CaptureError::AlreadyRun);
        };
        let Some(mut events) = graph.take_events() else {
            self.graph = Some(graph);
            return Err(CaptureError::EventsTaken);
        };

        let name = graph.name().to_string();
        let control = graph.eos_control();
        let health = graph.health();

        info!("{}: starting", name);
        if let Err(e) = graph.set_state(LifecycleState::Playing).await {
            error!("{}: {}", name, e);
            Self::teardown(&name, &mut graph).await;
            self.summary = Some(health.summary());
            return Err(e.into());
        }
        info!("{}: playing", name);

        let mut timer = self
            .settings
            .deadline
            .filter(|d| !d.is_zero())
            .map(|d| ShutdownTimer::arm(d, Arc::clone(&control)));

        let stop = self.stop.clone();
        let eos = control.eos_token();
        let period = self.settings.health_interval.max(Duration::from_millis(10));
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut grace: Option<Instant> = None;
        let mut stop_seen = false;

        let termination = loop {
            tokio::select! {
                biased;

                _ = stop.wait_cancellation() => {
                    warn!("{}: cancelled", name);
                    break Termination::Cancelled;
                }

                event = events.recv() => match event {
                    Some(Event::EndOfStream) => {
                        info!("{}: end of stream reached", name);
                        break Termination::EndOfStream;
                    }
                    Some(Event::Error { source, message }) => {
                        error!("{}: error from {}: {}", name, source, message);
                        break Termination::Error(format!("{}: {}", source, message));
                    }
                    Some(Event::StateChanged { old, new }) => {
                        debug!("{}: state changed {} -> {}", name, old, new);
                    }
                    Some(Event::Warning { source, message }) => {
                        warn!("{}: warning from {}: {}", name, source, message);
                    }
                    Some(other) => {
                        debug!("{}: {}", name, other);
                    }
                    None => {
                        error!("{}: event channel closed", name);
                        break Termination::Error("event channel closed".into());
                    }
                },

                _ = stop.wait_stop_request(), if !stop_seen => {
                    stop_seen = true;
                    control.send_end_of_stream();
                }

                _ = eos.cancelled(), if grace.is_none() => {
                    debug!("{}: waiting up to {:?} for end of stream", name, self.settings.eos_timeout);
                    grace = Some(Instant::now() + self.settings.eos_timeout);
                }

                _ = sleep_until_opt(grace) => {
                    error!("{}: no end of stream within {:?}", name, self.settings.eos_timeout);
                    break Termination::EosTimeout;
                }

                _ = tick.tick() => {
                    info!("{}: {}", name, health.summary());
                    for alert in health.check(self.settings.stall_threshold, 10.0) {
                        warn!("{}: {}", name, alert);
                    }
                }
            }
        };

        if let Some(timer) = timer.as_mut() {
            if timer.fired() {
                debug!("{}: end of stream was requested by the deadline", name);
            }
            timer.cancel();
        }

        Self::teardown(&name, &mut graph).await;
        drop(events);
        drop(graph);

        let summary = health.summary();
        info!("{}: finished ({}), {}", name, termination, summary);
        self.summary = Some(summary);
        Ok(termination)
    }

    async fn teardown(name: &str, graph: &mut G) {
        if let Err(e) = graph.set_state(LifecycleState::Null).await {
            error!("{}: teardown incomplete: {}", name, e);
        }
        debug!("{}: reached {}", name, graph.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::Registry;
    use crate::elements::testing::{self, Journal, Mark};
    use crate::error::ConstructionError;
    use crate::pipeline::graph::Graph;
    use crate::elements::ivfmux::{IVF_FRAME_HEADER_LEN, IVF_HEADER_LEN, IvfHeader};
    use crate::pipeline::stage::{StageKind, StageSpec};
    use crate::pipeline::topology::{Backend, DeviceSource, FactoryOverrides, StreamSource, Topology};

    fn setup() -> (Registry, Journal) {
        let mut registry = Registry::with_builtins();
        let journal = testing::register(&mut registry);
        (registry, journal)
    }

    fn source(options: &[(&str, &str)]) -> StageSpec {
        options
            .iter()
            .fold(StageSpec::new(StageKind::Capture, "countsrc"), |spec, (k, v)| {
                spec.option(k, v)
            })
    }

    fn sink() -> StageSpec {
        StageSpec::new(StageKind::Sink, "journalsink")
    }

    fn settings(deadline_ms: Option<u64>) -> ControllerSettings {
        ControllerSettings {
            deadline: deadline_ms.map(Duration::from_millis),
            eos_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn controller(
        specs: &[StageSpec],
        registry: &Registry,
        settings: ControllerSettings,
    ) -> (LifecycleController<Graph>, SignalOfStop) {
        let graph = Graph::build("test", specs, registry).unwrap();
        let stop = SignalOfStop::new();
        (LifecycleController::new(graph, settings, stop.clone()), stop)
    }

    #[tokio::test]
    async fn test_deadline_ends_with_eos() {
        let (registry, journal) = setup();
        let specs = [source(&[]), StageSpec::new(StageKind::Encode, "identity"), sink()];
        let (mut controller, _stop) = controller(&specs, &registry, settings(Some(100)));
        assert_eq!(controller.live_stages(), 3);

        let termination = controller.run().await.unwrap();
        assert_eq!(termination, Termination::EndOfStream);
        assert_eq!(termination.exit_code(), 0);

        assert_eq!(controller.live_stages(), 0);
        assert_eq!(journal.live(), 0);
        assert_eq!(journal.count(&Mark::Finalized), 1);
        assert!(journal.buffers() > 0);
        assert_eq!(
            controller.summary().map(|s| s.buffers_processed),
            Some(journal.buffers() as u64)
        );
    }

    #[tokio::test]
    async fn test_silent_source_runs_until_cancelled() {
        let (registry, journal) = setup();
        let specs = [source(&[("silent", "true")]), sink()];
        let (mut controller, stop) = controller(&specs, &registry, settings(None));

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let termination = controller.run().await.unwrap();
        assert_eq!(termination, Termination::Cancelled);
        assert!(termination.is_clean());
        assert_eq!(journal.buffers(), 0);
        assert_eq!(journal.count(&Mark::Finalized), 0);
        assert_eq!(journal.count(&Mark::Stopped), 2);
        assert_eq!(journal.live(), 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_on_silent_source_finalizes() {
        let (registry, journal) = setup();
        let specs = [source(&[("silent", "true")]), sink()];
        let (mut controller, stop) = controller(&specs, &registry, settings(None));

        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.raise();
        });

        assert_eq!(controller.run().await.unwrap(), Termination::EndOfStream);
        assert_eq!(journal.count(&Mark::Finalized), 1);
        assert_eq!(journal.live(), 0);
    }

    #[test]
    fn test_unknown_stage_never_reaches_playing() {
        let (registry, journal) = setup();
        let specs = [source(&[]), StageSpec::new(StageKind::Encode, "x264enc"), sink()];
        let err = CaptureError::from(Graph::build("test", &specs, &registry).err().unwrap());

        assert!(matches!(
            err,
            CaptureError::Construction(ConstructionError::StageCreation { .. })
        ));
        assert_ne!(err.exit_code(), 0);
        assert_eq!(journal.count(&Mark::Started), 0);
        assert_eq!(journal.live(), 0);
    }

    #[tokio::test]
    async fn test_stage_error_tears_down() {
        let (registry, journal) = setup();
        let specs = [
            source(&[]),
            StageSpec::new(StageKind::Encode, "failing").option("fail-after", 5),
            sink(),
        ];
        let (mut controller, _stop) = controller(&specs, &registry, settings(None));

        match controller.run().await.unwrap() {
            Termination::Error(message) => assert!(message.starts_with("encode:")),
            other => panic!("expected an error, got {}", other),
        }
        assert_eq!(controller.live_stages(), 0);
        assert_eq!(journal.count(&Mark::Stopped), 3);
        assert_eq!(journal.count(&Mark::Finalized), 0);
        assert_eq!(journal.live(), 0);
    }

    #[tokio::test]
    async fn test_slow_stage_does_not_finalize_early() {
        let (registry, journal) = setup();
        let specs = [
            source(&[]),
            StageSpec::new(StageKind::Convert, "delay").option("delay-ms", 20),
            sink(),
        ];
        let (mut controller, _stop) = controller(&specs, &registry, settings(Some(60)));

        assert_eq!(controller.run().await.unwrap(), Termination::EndOfStream);

        let marks = journal.marks();
        let received: Vec<u64> = marks
            .iter()
            .filter_map(|m| match m {
                Mark::Buffer(n) => Some(*n),
                _ => None,
            })
            .collect();
        // Everything queued behind the delay made it, in order, before finalizing
        assert!(!received.is_empty());
        assert_eq!(received, (0..received.len() as u64).collect::<Vec<_>>());
        let finalized = marks.iter().position(|m| *m == Mark::Finalized).unwrap();
        let last_buffer = marks.iter().rposition(|m| matches!(m, Mark::Buffer(_))).unwrap();
        assert!(last_buffer < finalized);
    }

    #[tokio::test]
    async fn test_eos_timeout() {
        let (registry, journal) = setup();
        let specs = [
            source(&[]),
            StageSpec::new(StageKind::Convert, "delay").option("delay-ms", 10_000),
            sink(),
        ];
        let mut settings = settings(Some(20));
        settings.eos_timeout = Duration::from_millis(100);
        let (mut controller, _stop) = controller(&specs, &registry, settings);

        let termination = controller.run().await.unwrap();
        assert_eq!(termination, Termination::EosTimeout);
        assert_eq!(termination.exit_code(), 1);
        assert_eq!(journal.count(&Mark::Finalized), 0);
        assert_eq!(journal.live(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_reports_state_change() {
        let (registry, journal) = setup();
        let specs = [source(&[]), sink().option("fail-start", true)];
        let (mut controller, _stop) = controller(&specs, &registry, settings(None));

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, CaptureError::StateChange(_)));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(controller.live_stages(), 0);
        assert_eq!(journal.live(), 0);
    }

    #[tokio::test]
    async fn test_runs_only_once() {
        let (registry, _journal) = setup();
        let specs = [source(&[("num-buffers", "3")]), sink()];
        let (mut controller, _stop) = controller(&specs, &registry, settings(None));

        assert_eq!(controller.run().await.unwrap(), Termination::EndOfStream);
        assert!(matches!(controller.run().await, Err(CaptureError::AlreadyRun)));
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let (registry, _journal) = setup();
        let specs = [source(&[]), sink()];
        let mut graph = Graph::build("test", &specs, &registry).unwrap();
        let _events = graph.take_events();

        let mut controller = LifecycleController::new(graph, settings(None), SignalOfStop::new());
        assert!(matches!(controller.run().await, Err(CaptureError::EventsTaken)));
        assert_eq!(controller.graph().map(|g| g.state()), Some(LifecycleState::Null));
    }

    fn recording(topology: &Topology, dir: &tempfile::TempDir) -> (Graph, std::path::PathBuf) {
        let path = dir.path().join("out.ivf");
        let specs = topology.stages(Backend::Builtin, &path.to_string_lossy(), &FactoryOverrides::new());
        let graph = Graph::build(topology.name(), &specs, &Registry::with_builtins()).unwrap();
        (graph, path)
    }

    #[tokio::test]
    async fn test_local_device_recording_is_well_formed() {
        let dir = tempfile::tempdir().unwrap();
        let topology = Topology::LocalDevice(DeviceSource {
            width: 64,
            height: 48,
            ..DeviceSource::default()
        });
        let (graph, path) = recording(&topology, &dir);
        let mut controller = LifecycleController::new(graph, settings(Some(300)), SignalOfStop::new());

        assert_eq!(controller.run().await.unwrap(), Termination::EndOfStream);
        assert_eq!(controller.live_stages(), 0);

        let data = std::fs::read(&path).unwrap();
        let header = IvfHeader::parse(&data).unwrap();
        assert_eq!(&header.fourcc, b"I420");
        assert_eq!((header.width, header.height), (64, 48));
        assert!(header.frame_count > 0);
        let frame_len = IVF_FRAME_HEADER_LEN + 64 * 48 * 3 / 2;
        assert_eq!(data.len(), IVF_HEADER_LEN + header.frame_count as usize * frame_len);
    }

    #[tokio::test]
    async fn test_cancelled_empty_stream_leaves_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let topology = Topology::NetworkStream(StreamSource {
            address: "127.0.0.1".into(),
            port: 0,
            ..StreamSource::default()
        });
        let (graph, path) = recording(&topology, &dir);
        let stop = SignalOfStop::new();
        let mut controller = LifecycleController::new(graph, settings(None), stop.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stop.cancel();
        });

        assert_eq!(controller.run().await.unwrap(), Termination::Cancelled);
        assert_eq!(controller.live_stages(), 0);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), IVF_HEADER_LEN);
        let header = IvfHeader::parse(&data).unwrap();
        assert_eq!((&header.fourcc, header.frame_count), (b"H264", 0));
    }
}
