//! Per-route counters kept by the proxy.

use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::envelope::Cmd;

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    count: u64,
    error_count: u64,
    total_latency: Duration,
}

/// Exported view of one route's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteStats {
    pub count: u64,
    pub error_count: u64,
    /// Seconds.
    pub mean_latency: f64,
}

impl From<Counter> for RouteStats {
    fn from(c: Counter) -> Self {
        let mean_latency = if c.count == 0 {
            0.0
        } else {
            c.total_latency.as_secs_f64() / c.count as f64
        };
        Self {
            count: c.count,
            error_count: c.error_count,
            mean_latency,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    routes: DashMap<Cmd, Counter>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished task.
    pub fn record(&self, cmd: Cmd, latency: Duration, failed: bool) {
        let mut counter = self.routes.entry(cmd).or_default();
        counter.count += 1;
        counter.total_latency += latency;
        if failed {
            counter.error_count += 1;
        }
    }

    pub fn get(&self, cmd: Cmd) -> Option<RouteStats> {
        self.routes.get(&cmd).map(|c| RouteStats::from(*c))
    }

    /// Ordered by cmd; serializes with cmds as decimal string keys.
    pub fn snapshot(&self) -> BTreeMap<Cmd, RouteStats> {
        self.routes
            .iter()
            .map(|entry| (*entry.key(), RouteStats::from(*entry.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_count_errors_and_latency() {
        let stats = StatsRegistry::new();
        stats.record(7, Duration::from_millis(100), false);
        stats.record(7, Duration::from_millis(300), true);
        stats.record(8, Duration::from_millis(50), false);

        let seven = stats.get(7).unwrap();
        assert_eq!(seven.count, 2);
        assert_eq!(seven.error_count, 1);
        assert!((seven.mean_latency - 0.2).abs() < 1e-9);
        assert!(stats.get(9).is_none());
    }

    #[test]
    fn snapshot_serializes_keyed_by_cmd() {
        let stats = StatsRegistry::new();
        stats.record(20, Duration::from_millis(500), false);
        stats.record(3, Duration::from_secs(1), true);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "3": {"count": 1, "error_count": 1, "mean_latency": 1.0},
                "20": {"count": 1, "error_count": 0, "mean_latency": 0.5},
            })
        );
    }
}
