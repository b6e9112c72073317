//! Health monitoring and metrics for a capture graph

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Health metrics for a graph
///
/// Counters are updated by the stage workers and read by the controller.
/// All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Buffers that reached the final stage
    pub buffers_processed: AtomicU64,

    /// Total bytes that reached the final stage
    pub bytes_processed: AtomicU64,

    /// Keyframes that reached the final stage
    pub keyframes_processed: AtomicU64,

    /// Buffers discarded by a stage (bad payload type, lost fragments, ...)
    pub buffers_dropped: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last buffer seen by the final stage
    pub last_buffer_time: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            buffers_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            keyframes_processed: AtomicU64::new(0),
            buffers_dropped: AtomicU64::new(0),
            last_buffer_time: AtomicU64::new(now_micros()),
        }
    }

    /// Record a buffer arriving at the final stage
    pub fn record_buffer(&self, size: usize, is_keyframe: bool) {
        self.last_buffer_time.store(now_micros(), Ordering::Relaxed);
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a buffer discarded inside the graph
    pub fn record_drop(&self) {
        self.buffers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffers_processed(&self) -> u64 {
        self.buffers_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn keyframes_processed(&self) -> u64 {
        self.keyframes_processed.load(Ordering::Relaxed)
    }

    pub fn buffers_dropped(&self) -> u64 {
        self.buffers_dropped.load(Ordering::Relaxed)
    }

    /// Calculate the drop rate as a percentage of everything seen
    pub fn drop_rate(&self) -> f64 {
        let drops = self.buffers_dropped();
        let seen = self.buffers_processed() + drops;
        if seen == 0 {
            return 0.0;
        }
        (drops as f64 / seen as f64) * 100.0
    }

    /// Check if the graph has stalled (no buffers for the given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_buffer_time.load(Ordering::Relaxed);
        let elapsed_micros = now_micros().saturating_sub(last);
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Evaluate the counters against alert thresholds
    pub fn check(&self, stall_threshold: Duration, drop_rate_threshold: f64) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();
        if self.is_stalled(stall_threshold) {
            alerts.push(HealthAlert::Stalled {
                duration: stall_threshold,
            });
        }
        let rate = self.drop_rate();
        if rate > drop_rate_threshold {
            alerts.push(HealthAlert::HighDropRate { rate });
        }
        alerts
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            buffers_processed: self.buffers_processed(),
            bytes_processed: self.bytes_processed(),
            keyframes_processed: self.keyframes_processed(),
            buffers_dropped: self.buffers_dropped(),
            drop_rate: self.drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub buffers_processed: u64,
    pub bytes_processed: u64,
    pub keyframes_processed: u64,
    pub buffers_dropped: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} buffers ({} keyframes), {} bytes, {} dropped ({:.2}%)",
            self.buffers_processed,
            self.keyframes_processed,
            self.bytes_processed,
            self.buffers_dropped,
            self.drop_rate
        )
    }
}

/// Health alert types
#[derive(Debug, Clone)]
pub enum HealthAlert {
    /// No buffers for the threshold duration
    Stalled { duration: Duration },

    /// High drop rate detected
    HighDropRate { rate: f64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "No data reached the sink for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High drop rate: {:.2}%", rate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_buffer(1000, false);
        health.record_buffer(2000, true);
        health.record_buffer(1500, false);

        assert_eq!(health.buffers_processed(), 3);
        assert_eq!(health.bytes_processed(), 4500);
        assert_eq!(health.keyframes_processed(), 1);
        assert_eq!(health.buffers_dropped(), 0);
        assert_eq!(health.drop_rate(), 0.0);

        health.record_drop();
        assert_eq!(health.buffers_dropped(), 1);
        assert!((health.drop_rate() - 25.0).abs() < f64::EPSILON);

        let alerts = health.check(Duration::from_secs(60), 10.0);
        assert!(matches!(alerts.as_slice(), [HealthAlert::HighDropRate { .. }]));
    }

    #[test]
    fn test_stall_detection() {
        let health = PipelineHealth::new();

        // Should not be stalled immediately
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_buffer(1000, false);
        std::thread::sleep(Duration::from_millis(150));

        assert!(health.is_stalled(Duration::from_millis(100)));
        let alerts = health.check(Duration::from_millis(100), 100.0);
        assert!(matches!(alerts.as_slice(), [HealthAlert::Stalled { .. }]));
    }
}
