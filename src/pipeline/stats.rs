//! Counters written by the downloader stage and the metrics derived from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Accumulator shared between the pipeline node and its downloader.
#[derive(Debug, Default)]
pub struct StatsCollector {
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    computed_ns: AtomicU64,
    in_node_ns: AtomicU64,
    inter_completion_ns: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one retired task. `inter_completion` is the gap since the
    /// previous retirement and is absent for the first task.
    pub(crate) fn record(&self, computed: Duration, in_node: Duration, inter_completion: Option<Duration>) {
        self.computed_ns.fetch_add(as_nanos(computed), Ordering::Relaxed);
        self.in_node_ns.fetch_add(as_nanos(in_node), Ordering::Relaxed);
        if let Some(gap) = inter_completion {
            self.inter_completion_ns.fetch_add(as_nanos(gap), Ordering::Relaxed);
        }
        self.tasks_processed.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_processed: self.tasks_processed(),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            computed_ns: self.computed_ns.load(Ordering::Relaxed),
            in_node_ns: self.in_node_ns.load(Ordering::Relaxed),
            inter_completion_ns: self.inter_completion_ns.load(Ordering::Relaxed),
        }
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    /// Sum of the backends' blocking read-back times.
    pub computed_ns: u64,
    /// Sum of intake-to-retirement latencies.
    pub in_node_ns: u64,
    /// Sum of gaps between consecutive retirements.
    pub inter_completion_ns: u64,
}

/// Per-task averages in milliseconds, plus throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceData {
    pub avg_service_time_ms: f64,
    pub avg_in_node_time_ms: f64,
    pub avg_computed_ms: f64,
    pub avg_overhead_ms: f64,
    /// Tasks per second over the whole run.
    pub throughput: f64,
    pub elapsed_s: f64,
}

impl PerformanceData {
    pub fn calculate(stats: &StatsSnapshot, elapsed: Duration) -> Self {
        let count = stats.tasks_processed;
        let elapsed_s = elapsed.as_secs_f64();
        if count == 0 {
            return Self {
                elapsed_s,
                ..Self::default()
            };
        }

        let ms = |ns: u64, divisor: u64| ns as f64 / divisor as f64 / 1.0e6;
        let avg_service_time_ms = if count > 1 {
            ms(stats.inter_completion_ns, count - 1)
        } else {
            0.0
        };
        let avg_in_node_time_ms = ms(stats.in_node_ns, count);
        let avg_computed_ms = ms(stats.computed_ns, count);

        Self {
            avg_service_time_ms,
            avg_in_node_time_ms,
            avg_computed_ms,
            avg_overhead_ms: avg_in_node_time_ms - avg_computed_ms,
            throughput: if elapsed_s > 0.0 { count as f64 / elapsed_s } else { 0.0 },
            elapsed_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let stats = StatsCollector::new();
        stats.record(Duration::from_millis(2), Duration::from_millis(5), None);
        stats.record(Duration::from_millis(4), Duration::from_millis(7), Some(Duration::from_millis(3)));
        stats.record_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_processed, 2);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.computed_ns, 6_000_000);
        assert_eq!(snap.in_node_ns, 12_000_000);
        assert_eq!(snap.inter_completion_ns, 3_000_000);
    }

    #[test]
    fn test_performance_averages() {
        let snap = StatsSnapshot {
            tasks_processed: 3,
            tasks_failed: 0,
            computed_ns: 3_000_000,
            in_node_ns: 9_000_000,
            inter_completion_ns: 4_000_000,
        };
        let perf = PerformanceData::calculate(&snap, Duration::from_secs(2));
        assert_eq!(perf.avg_service_time_ms, 2.0);
        assert_eq!(perf.avg_in_node_time_ms, 3.0);
        assert_eq!(perf.avg_computed_ms, 1.0);
        assert_eq!(perf.avg_overhead_ms, 2.0);
        assert_eq!(perf.throughput, 1.5);
        assert_eq!(perf.elapsed_s, 2.0);
    }

    #[test]
    fn test_empty_run_has_zero_metrics() {
        let perf = PerformanceData::calculate(&StatsSnapshot::default(), Duration::from_millis(10));
        assert_eq!(perf.throughput, 0.0);
        assert_eq!(perf.avg_in_node_time_ms, 0.0);
    }

    #[test]
    fn test_single_task_has_no_service_time() {
        let snap = StatsSnapshot {
            tasks_processed: 1,
            computed_ns: 1_000_000,
            in_node_ns: 1_000_000,
            ..StatsSnapshot::default()
        };
        assert_eq!(PerformanceData::calculate(&snap, Duration::from_secs(1)).avg_service_time_ms, 0.0);
    }
}
