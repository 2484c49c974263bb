use crate::config::StreamerConfig;
use crate::stats::MovingAverage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const PERF_WINDOW: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    /// Share of the tick budget spent inside ticks, 0..=1.
    pub cpu_usage: f64,
    /// MB held by frame history plus packets waiting in client mailboxes.
    pub memory_usage: f64,
    pub average_latency_ms: f64,
    pub client_count: usize,
    pub frames_streamed: u64,
    pub bytes_transmitted: u64,
    pub superseded_frames: u64,
    pub skipped_ticks: u64,
    pub send_failures: u64,
    /// Times a lagging client had its decimation raised.
    pub backoff_raises: u64,
    pub config: StreamerConfig,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_streamed: AtomicU64,
    pub bytes_transmitted: AtomicU64,
    pub superseded_frames: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub send_failures: AtomicU64,
    pub backoff_raises: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct Perf {
    pub tick_cost_ms: MovingAverage,
    pub latency_ms: MovingAverage,
}

impl Default for Perf {
    fn default() -> Self {
        Self {
            tick_cost_ms: MovingAverage::new(PERF_WINDOW),
            latency_ms: MovingAverage::new(PERF_WINDOW),
        }
    }
}

impl Perf {
    pub fn cpu_usage(&self, cfg: &StreamerConfig) -> f64 {
        let budget_ms = 1000.0 / cfg.streaming_rate_hz;
        if !budget_ms.is_finite() || budget_ms <= 0.0 {
            return 0.0;
        }
        (self.tick_cost_ms.get() / budget_ms).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_usage_is_share_of_tick_budget() {
        let cfg = StreamerConfig {
            streaming_rate_hz: 10.0,
            ..StreamerConfig::default()
        };
        let mut perf = Perf::default();
        assert_eq!(perf.cpu_usage(&cfg), 0.0);
        perf.tick_cost_ms.insert(25.0);
        perf.tick_cost_ms.insert(75.0);
        assert!((perf.cpu_usage(&cfg) - 0.5).abs() < 1e-9);
        perf.tick_cost_ms.insert(10_000.0);
        assert_eq!(perf.cpu_usage(&cfg), 1.0);
    }
}
