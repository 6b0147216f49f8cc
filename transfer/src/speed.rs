//! Session-wide throughput estimate used to pick between the single fast
//! whole-file copy and the chunked, progress-reporting copy.

/// If the estimated whole-file copy time reaches this, prefer the streaming
/// path so progress is visible and the transfer is cancelable mid-file.
pub const STREAM_THRESHOLD: std::time::Duration = std::time::Duration::from_millis(500);

/// Running average of copy throughput across all files in a session.
///
/// Owned by the controller and passed by reference into each engine
/// invocation, so later files benefit from throughput learned on earlier
/// ones. Not persisted beyond the process lifetime.
#[derive(Debug, Default)]
pub struct SpeedTracker {
    total_bytes: u64,
    total_time: std::time::Duration,
}

impl SpeedTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed copy. Called after every file to keep the
    /// estimate fresh as disk/network conditions change.
    pub fn record(&mut self, bytes: u64, elapsed: std::time::Duration) {
        self.total_bytes += bytes;
        self.total_time += elapsed;
    }

    /// Average throughput in bytes per second, if any sample exists.
    #[must_use]
    pub fn bytes_per_sec(&self) -> Option<f64> {
        if self.total_bytes == 0 || self.total_time.is_zero() {
            return None;
        }
        Some(self.total_bytes as f64 / self.total_time.as_secs_f64())
    }

    /// Whether a file of `len` bytes should use the chunked copy path.
    ///
    /// Before any sample exists this is always true - the conservative
    /// default, since no throughput estimate exists yet. This is a
    /// heuristic, not a guarantee.
    #[must_use]
    pub fn should_stream(&self, len: u64) -> bool {
        let Some(rate) = self.bytes_per_sec() else {
            return true;
        };
        // compared in seconds; a huge file over a slow link can estimate
        // beyond what a Duration holds
        len as f64 / rate >= STREAM_THRESHOLD.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_before_any_sample() {
        let tracker = SpeedTracker::new();
        assert!(tracker.should_stream(1));
        assert!(tracker.should_stream(u64::MAX));
    }

    #[test]
    fn threshold_splits_on_estimated_duration() {
        let mut tracker = SpeedTracker::new();
        // 1000 bytes per millisecond
        tracker.record(1_000_000, std::time::Duration::from_millis(1000));
        // 400ms estimate - fast path
        assert!(!tracker.should_stream(400_000));
        // 600ms estimate - streaming path
        assert!(tracker.should_stream(600_000));
    }

    #[test]
    fn exact_threshold_estimate_streams() {
        let mut tracker = SpeedTracker::new();
        // 1000 bytes per millisecond; 500_000 bytes estimate exactly 500ms
        tracker.record(1_000_000, std::time::Duration::from_millis(1000));
        assert!(tracker.should_stream(500_000));
    }

    #[test]
    fn pathological_estimates_do_not_panic() {
        let mut tracker = SpeedTracker::new();
        // 1 byte per hour makes the largest file estimate astronomically
        tracker.record(1, std::time::Duration::from_secs(3600));
        assert!(tracker.should_stream(u64::MAX));
    }

    #[test]
    fn later_samples_shift_the_estimate() {
        let mut tracker = SpeedTracker::new();
        tracker.record(1_000, std::time::Duration::from_millis(1000));
        // 1 byte/ms: a 600 byte file estimates over the threshold
        assert!(tracker.should_stream(600));
        // a much faster sample dominates the running average
        tracker.record(999_000, std::time::Duration::from_millis(0));
        assert!(!tracker.should_stream(600));
    }
}
