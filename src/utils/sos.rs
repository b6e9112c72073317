use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

/// Two-level external stop request
///
/// The first `raise` asks for a graceful stop (end-of-stream), the second
/// one cancels outright. Clones share the same state, so the Ctrl-C handler
/// and the controller can each hold one.
#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    raised: AtomicU8,
    graceful: CancellationToken,
    hard: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                raised: AtomicU8::new(0),
                graceful: CancellationToken::new(),
                hard: CancellationToken::new(),
            }),
        }
    }

    /// Escalate by one level. Returns the number of times it has been raised.
    pub fn raise(&self) -> u8 {
        let level = self.shared.raised.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        match level {
            1 => {
                info!("Stop requested, finishing the recording");
                self.shared.graceful.cancel();
            }
            _ => {
                warn!("Stop requested again, aborting");
                self.cancel();
            }
        }
        level
    }

    /// Skip the graceful level and cancel now
    pub fn cancel(&self) {
        self.shared.graceful.cancel();
        self.shared.hard.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.graceful.is_cancelled()
    }

    pub fn cancelled(&self) -> bool {
        self.shared.hard.is_cancelled()
    }

    /// Resolves on the first `raise`
    pub async fn wait_stop_request(&self) {
        self.shared.graceful.cancelled().await
    }

    /// Resolves once cancelled
    pub async fn wait_cancellation(&self) {
        self.shared.hard.cancelled().await
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

// Implementing the Clone trait
impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}
