//! Running-time clock shared by the stages of one graph

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::types::Timestamp;

/// Media clock for buffer timestamps
///
/// The clock is created when a graph goes to Paused and started when it goes
/// to Playing. Until then `running_time` reports zero, so anything a source
/// produces before data is allowed to flow lands at the start of the file.
///
/// # Thread Safety
///
/// Clones share the same base; the base is set at most once.
#[derive(Clone, Default)]
pub struct MediaClock {
    /// Base instant, set when the graph starts playing
    base: Arc<OnceLock<Instant>>,
}

impl MediaClock {
    /// Create a clock that has not started yet
    pub fn new() -> Self {
        Self {
            base: Arc::new(OnceLock::new()),
        }
    }

    /// Start the clock now. Later calls keep the first base.
    pub fn start(&self) {
        let _ = self.base.set(Instant::now());
    }

    /// Whether the clock has been started
    pub fn is_running(&self) -> bool {
        self.base.get().is_some()
    }

    /// Get the base instant, if started
    pub fn base(&self) -> Option<Instant> {
        self.base.get().copied()
    }

    /// Time elapsed since the clock started
    pub fn running_time(&self) -> Duration {
        self.base.get().map(Instant::elapsed).unwrap_or_default()
    }

    /// Current running time as a buffer timestamp
    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.running_time())
    }

    /// Timestamp of frame `index` for a fixed frame rate
    pub fn frame_timestamp(index: u64, framerate: u32) -> Timestamp {
        let rate = framerate.max(1) as u64;
        Timestamp::from_micros((index * 1_000_000 / rate) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_zero_until_started() {
        let clock = MediaClock::new();
        assert!(!clock.is_running());
        assert_eq!(clock.now(), Timestamp::ZERO);
    }

    #[test]
    fn test_clock_keeps_first_base() {
        let clock = MediaClock::new();
        clock.start();
        let base = clock.base();
        std::thread::sleep(Duration::from_millis(5));
        clock.clone().start();
        assert_eq!(clock.base(), base);
        assert!(clock.now().micros >= 5_000);
    }

    #[test]
    fn test_frame_timestamp() {
        assert_eq!(MediaClock::frame_timestamp(0, 30).micros, 0);
        assert_eq!(MediaClock::frame_timestamp(30, 30).micros, 1_000_000);
        assert_eq!(MediaClock::frame_timestamp(1, 25).micros, 40_000);
        // A zero rate is treated as one frame per second
        assert_eq!(MediaClock::frame_timestamp(2, 0).micros, 2_000_000);
    }
}
