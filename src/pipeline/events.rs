//! Lifecycle events posted by a running graph
//!
//! The graph posts from its worker tasks; exactly one consumer (the
//! lifecycle controller) receives them in order.

use log::warn;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::LifecycleState;

/// Events emitted by a graph during execution
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The final stage finalized its output after all upstream data drained
    EndOfStream,

    /// A stage failed; the run cannot continue
    Error {
        /// Stage that reported the failure
        source: String,
        message: String,
    },

    /// The graph completed one state step
    StateChanged {
        old: LifecycleState,
        new: LifecycleState,
    },

    /// Non-fatal issue reported by a stage
    Warning { source: String, message: String },

    /// A source produced its first buffer
    StreamStarted { stage: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::EndOfStream => write!(f, "EOS"),
            Event::Error { source, message } => write!(f, "Error in {}: {}", source, message),
            Event::StateChanged { old, new } => write!(f, "StateChanged: {} -> {}", old, new),
            Event::Warning { source, message } => write!(f, "Warning in {}: {}", source, message),
            Event::StreamStarted { stage } => write!(f, "Stream started by {}", stage),
        }
    }
}

/// Sending half of the event channel, cloned into every worker
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

/// Receiving half of the event channel
pub type EventReceiver = mpsc::Receiver<Event>;

impl EventBus {
    /// Create a bounded channel
    pub fn channel(capacity: usize) -> (EventBus, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventBus { tx }, rx)
    }

    /// Post an informational event without waiting.
    /// Dropped with a log line if the consumer is behind.
    pub fn post(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event channel full, dropping: {}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Post a terminal event (EOS or error), waiting for room unless the
    /// graph is flushing. Returns whether the event was delivered.
    pub async fn post_terminal(&self, event: Event, flushing: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            result = self.tx.send(event) => result.is_ok(),
            _ = flushing.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (bus, mut rx) = EventBus::channel(4);
        bus.post(Event::StateChanged {
            old: LifecycleState::Null,
            new: LifecycleState::Ready,
        });
        assert!(bus.post_terminal(Event::EndOfStream, &CancellationToken::new()).await);

        assert!(matches!(rx.recv().await, Some(Event::StateChanged { .. })));
        assert_eq!(rx.recv().await, Some(Event::EndOfStream));
    }

    #[tokio::test]
    async fn test_informational_events_drop_when_full() {
        let (bus, mut rx) = EventBus::channel(1);
        bus.post(Event::StreamStarted { stage: "a".into() });
        bus.post(Event::StreamStarted { stage: "b".into() });

        assert_eq!(rx.recv().await, Some(Event::StreamStarted { stage: "a".into() }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_post_gives_up_when_flushing() {
        let (bus, _rx) = EventBus::channel(1);
        bus.post(Event::StreamStarted { stage: "a".into() });

        let flushing = CancellationToken::new();
        flushing.cancel();
        assert!(!bus.post_terminal(Event::EndOfStream, &flushing).await);
    }
}
