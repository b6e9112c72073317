//! One-shot deadline that asks a playing graph to end its stream

use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::graph::EosControl;
use super::state::LifecycleState;

/// Fires `send_end_of_stream` once after a deadline
///
/// The timer never changes graph state itself. If the graph is not Playing
/// when the deadline passes, it does nothing.
pub struct ShutdownTimer {
    task: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl ShutdownTimer {
    /// Spawn the timer task on the current runtime
    pub fn arm(deadline: Duration, control: Arc<dyn EosControl>) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let state = control.state();
            if state != LifecycleState::Playing {
                debug!("Shutdown timer expired in {}, nothing to do", state);
                return;
            }
            info!("Recording deadline of {:?} reached, sending EOS", deadline);
            if control.send_end_of_stream() {
                flag.store(true, Ordering::SeqCst);
            }
        });

        Self {
            task: Some(task),
            fired,
        }
    }

    /// Whether this timer is the one that requested end-of-stream
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop the timer if it has not fired yet
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ShutdownTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
