//! Rolling window of heartbeat response outcomes

use std::collections::VecDeque;
use std::time::Duration;

/// Number of outcomes retained per connection
pub const RESPONSE_WINDOW_CAPACITY: usize = 100;

/// One recorded heartbeat response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSample {
    /// Detection to send completion; deadline length for misses
    pub latency: Duration,
    pub responded: bool,
}

/// Last N response outcomes, oldest evicted first
#[derive(Debug, Clone)]
pub struct ResponseWindow {
    samples: VecDeque<ResponseSample>,
    capacity: usize,
}

impl Default for ResponseWindow {
    fn default() -> Self {
        Self::with_capacity(RESPONSE_WINDOW_CAPACITY)
    }
}

impl ResponseWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: ResponseSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResponseSample> {
        self.samples.iter()
    }

    /// Share of recorded probes that were answered in time
    pub fn success_ratio(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let ok = self.samples.iter().filter(|s| s.responded).count();
        Some(ok as f64 / self.samples.len() as f64)
    }

    /// Mean latency of successful responses
    pub fn mean_latency(&self) -> Option<Duration> {
        let (sum, n) = self
            .samples
            .iter()
            .filter(|s| s.responded)
            .fold((Duration::ZERO, 0u32), |(sum, n), s| (sum + s.latency, n + 1));
        if n == 0 {
            None
        } else {
            Some(sum / n)
        }
    }

    /// Nearest-rank percentile of successful response latency, `pct` in 0..=100
    pub fn percentile(&self, pct: f64) -> Option<Duration> {
        let mut latencies: Vec<Duration> = self
            .samples
            .iter()
            .filter(|s| s.responded)
            .map(|s| s.latency)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let pct = pct.clamp(0.0, 100.0);
        let rank = ((pct / 100.0) * latencies.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(latencies.len() - 1);
        Some(latencies[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(ms: u64) -> ResponseSample {
        ResponseSample {
            latency: Duration::from_millis(ms),
            responded: true,
        }
    }

    fn miss(ms: u64) -> ResponseSample {
        ResponseSample {
            latency: Duration::from_millis(ms),
            responded: false,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let mut window = ResponseWindow::with_capacity(3);
        for ms in [1, 2, 3, 4] {
            window.record(ok(ms));
        }
        assert_eq!(window.len(), 3);
        let kept: Vec<u64> = window.iter().map(|s| s.latency.as_millis() as u64).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn test_default_capacity_is_100() {
        let mut window = ResponseWindow::new();
        for i in 0..150 {
            window.record(ok(i));
        }
        assert_eq!(window.len(), 100);
        assert_eq!(window.iter().next().unwrap().latency, Duration::from_millis(50));
    }

    #[test]
    fn test_statistics_ignore_misses_for_latency() {
        let mut window = ResponseWindow::new();
        window.record(ok(10));
        window.record(ok(30));
        window.record(miss(3000));
        window.record(ok(20));

        assert_eq!(window.success_ratio(), Some(0.75));
        assert_eq!(window.mean_latency(), Some(Duration::from_millis(20)));
        assert_eq!(window.percentile(50.0), Some(Duration::from_millis(20)));
        assert_eq!(window.percentile(100.0), Some(Duration::from_millis(30)));
        assert_eq!(window.percentile(0.0), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_empty_window() {
        let window = ResponseWindow::new();
        assert!(window.success_ratio().is_none());
        assert!(window.mean_latency().is_none());
        assert!(window.percentile(99.0).is_none());
    }
}
