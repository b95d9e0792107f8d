//! Execution metrics models.
//!
//! Snapshots are immutable: each collection tick produces a new value that
//! supersedes the previous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;

/// Raw execution counters as kept by the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCounters {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Running average maintained by the ledger
    pub average_execution_time_ms: f64,
}

/// Success ratio, `0.0` when nothing has executed yet.
pub fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (successful as f64 / total as f64).clamp(0.0, 1.0)
}

/// One metrics sample for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agent_id: AgentId,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate: f64,
    pub average_execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn from_counters(agent_id: AgentId, counters: RawCounters) -> Self {
        Self {
            agent_id,
            total_executions: counters.total_executions,
            successful_executions: counters.successful_executions,
            failed_executions: counters.failed_executions,
            success_rate: success_rate(counters.successful_executions, counters.total_executions),
            average_execution_time_ms: counters.average_execution_time_ms.max(0.0),
            timestamp: Utc::now(),
        }
    }
}

/// System-wide rollup computed on the same tick as the per-agent snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub agent_count: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Execution-weighted success rate
    pub success_rate: f64,
    /// Execution-weighted average latency
    pub average_execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl AggregatedMetrics {
    pub fn from_snapshots(snapshots: &[MetricsSnapshot]) -> Self {
        let total: u64 = snapshots.iter().map(|s| s.total_executions).sum();
        let successful: u64 = snapshots.iter().map(|s| s.successful_executions).sum();
        let failed: u64 = snapshots.iter().map(|s| s.failed_executions).sum();

        let average_execution_time_ms = if total == 0 {
            0.0
        } else {
            snapshots
                .iter()
                .map(|s| s.average_execution_time_ms * s.total_executions as f64)
                .sum::<f64>()
                / total as f64
        };

        Self {
            agent_count: snapshots.len(),
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            success_rate: success_rate(successful, total),
            average_execution_time_ms,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn counters(total: u64, successful: u64, avg: f64) -> RawCounters {
        RawCounters {
            total_executions: total,
            successful_executions: successful,
            failed_executions: total.saturating_sub(successful),
            average_execution_time_ms: avg,
        }
    }

    #[test]
    fn test_success_rate_zero_total() {
        assert_eq!(success_rate(0, 0), 0.0);
    }

    #[test]
    fn test_snapshot_seven_of_ten() {
        let snapshot = MetricsSnapshot::from_counters(Uuid::new_v4(), counters(10, 7, 120.0));
        assert!((snapshot.success_rate - 0.7).abs() < f64::EPSILON);
        assert_eq!(snapshot.failed_executions, 3);
        assert!((snapshot.average_execution_time_ms - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_is_execution_weighted() {
        let a = MetricsSnapshot::from_counters(Uuid::new_v4(), counters(10, 10, 100.0));
        let b = MetricsSnapshot::from_counters(Uuid::new_v4(), counters(30, 15, 200.0));
        let idle = MetricsSnapshot::from_counters(Uuid::new_v4(), counters(0, 0, 0.0));

        let aggregate = AggregatedMetrics::from_snapshots(&[a, b, idle]);

        assert_eq!(aggregate.agent_count, 3);
        assert_eq!(aggregate.total_executions, 40);
        assert_eq!(aggregate.successful_executions, 25);
        assert!((aggregate.success_rate - 0.625).abs() < 1e-9);
        assert!((aggregate.average_execution_time_ms - 175.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_of_nothing() {
        let aggregate = AggregatedMetrics::from_snapshots(&[]);
        assert_eq!(aggregate.agent_count, 0);
        assert_eq!(aggregate.success_rate, 0.0);
        assert_eq!(aggregate.average_execution_time_ms, 0.0);
    }

    proptest! {
        #[test]
        fn prop_success_rate_within_unit_interval(successful in 0u64..10_000, total in 0u64..10_000) {
            let rate = success_rate(successful, total);
            prop_assert!((0.0..=1.0).contains(&rate));
            if total == 0 {
                prop_assert_eq!(rate, 0.0);
            }
        }
    }
}
