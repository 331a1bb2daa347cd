//! Rolling latency average of one block node

/// Number of samples in the rolling window
pub const LATENCY_SAMPLES: usize = 5;

/// Average reported until the window has filled once, sorts after every known latency
pub const UNKNOWN_LATENCY: u64 = u64::MAX;

/// Fixed-size circular buffer of round-trip latencies in milliseconds.
///
/// Not synchronized, owners share it behind a lock.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    samples: [u64; LATENCY_SAMPLES],
    index: usize,
    filled: bool,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: u64) {
        self.samples[self.index] = latency;
        self.index += 1;
        if self.index == LATENCY_SAMPLES {
            // Fold back so the index never grows
            self.index = 0;
            self.filled = true;
        }
    }

    pub fn average(&self) -> u64 {
        if !self.filled {
            return UNKNOWN_LATENCY;
        }
        let sum: u128 = self.samples.iter().map(|s| *s as u128).sum();
        (sum / LATENCY_SAMPLES as u128) as u64
    }

    pub fn is_known(&self) -> bool {
        self.filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_until_full() {
        let mut tracker = LatencyTracker::new();
        for latency in 1..LATENCY_SAMPLES as u64 {
            tracker.record(latency);
            assert_eq!(tracker.average(), UNKNOWN_LATENCY);
        }
        tracker.record(5);
        assert_eq!(tracker.average(), 3);
        assert!(tracker.is_known());
    }

    #[test]
    fn test_average_of_latest_samples() {
        let mut tracker = LatencyTracker::new();
        for latency in [100, 100, 100, 100, 100, 10, 20, 30] {
            tracker.record(latency);
        }
        // Window holds 100, 100, 10, 20, 30
        assert_eq!(tracker.average(), 52);
    }

    #[test]
    fn test_wraparound() {
        let mut tracker = LatencyTracker::new();
        for i in 0..1_000_000u64 {
            tracker.record(i % 7);
        }
        let expected: u64 = (1_000_000u64 - 5..1_000_000).map(|i| i % 7).sum::<u64>() / 5;
        assert_eq!(tracker.average(), expected);
    }

    #[test]
    fn test_large_values_do_not_overflow() {
        let mut tracker = LatencyTracker::new();
        for _ in 0..LATENCY_SAMPLES {
            tracker.record(u64::MAX - 1);
        }
        assert_eq!(tracker.average(), u64::MAX - 1);
    }
}
