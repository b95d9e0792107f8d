//! Threshold alerting over metrics snapshots with hysteresis.
//!
//! Each sample is classified into a level. The agent's severity only moves up
//! after `consecutive_breaches_to_escalate` samples in a row above it, and
//! only moves down after `consecutive_clean_to_recover` samples in a row below
//! it. A sample at the current severity resets both streaks.
//!
//! Samples arrive straight from the metrics collector, one call per snapshot
//! in collection order, so no sample can be skipped between two others.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::event_bus::{EventBus, EventPayload};
use crate::domain::models::{
    AgentId, AlertChange, AlertMetric, AlertSeverity, AlertState, AlertThresholds,
    MetricsSnapshot,
};
use crate::domain::DomainError;

/// Level a single sample maps to, before hysteresis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleLevel {
    pub severity: AlertSeverity,
    pub metric: AlertMetric,
    pub value: f64,
}

#[derive(Debug, Clone)]
struct Tracker {
    state: AlertState,
    breach_streak: u32,
    /// Lowest level seen during the current breach streak
    breach_floor: AlertSeverity,
    clean_streak: u32,
    /// Highest level seen during the current clean streak
    clean_ceiling: AlertSeverity,
}

impl Tracker {
    fn new(agent_id: AgentId) -> Self {
        Self {
            state: AlertState {
                agent_id,
                severity: AlertSeverity::None,
                metric: AlertMetric::SuccessRate,
                value: 0.0,
                entered_at: Utc::now(),
            },
            breach_streak: 0,
            breach_floor: AlertSeverity::Critical,
            clean_streak: 0,
            clean_ceiling: AlertSeverity::None,
        }
    }

    fn reset_streaks(&mut self) {
        self.breach_streak = 0;
        self.breach_floor = AlertSeverity::Critical;
        self.clean_streak = 0;
        self.clean_ceiling = AlertSeverity::None;
    }
}

pub struct AlertEngine {
    thresholds: AlertThresholds,
    trackers: Mutex<HashMap<AgentId, Tracker>>,
    event_bus: Arc<EventBus>,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds, event_bus: Arc<EventBus>) -> Self {
        Self {
            thresholds,
            trackers: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    pub const fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Check threshold consistency.
    pub fn validate_thresholds(thresholds: &AlertThresholds) -> Result<(), DomainError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(thresholds.warning_success_rate) || !in_unit(thresholds.critical_success_rate) {
            return Err(DomainError::InvalidConfiguration(
                "alert success-rate thresholds must be within [0, 1]".to_string(),
            ));
        }
        if thresholds.critical_success_rate > thresholds.warning_success_rate {
            return Err(DomainError::InvalidConfiguration(format!(
                "critical_success_rate ({}) must not exceed warning_success_rate ({})",
                thresholds.critical_success_rate, thresholds.warning_success_rate
            )));
        }
        if thresholds.max_average_execution_time_ms <= 0.0 {
            return Err(DomainError::InvalidConfiguration(
                "max_average_execution_time_ms must be positive".to_string(),
            ));
        }
        if thresholds.consecutive_breaches_to_escalate == 0
            || thresholds.consecutive_clean_to_recover == 0
        {
            return Err(DomainError::InvalidConfiguration(
                "alert streak lengths must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Map one sample to a level, ignoring history.
    pub fn classify(&self, snapshot: &MetricsSnapshot) -> SampleLevel {
        let t = &self.thresholds;
        let rate = snapshot.success_rate;

        if snapshot.total_executions >= t.min_executions {
            if rate < t.critical_success_rate {
                return SampleLevel {
                    severity: AlertSeverity::Critical,
                    metric: AlertMetric::SuccessRate,
                    value: rate,
                };
            }
            if rate < t.warning_success_rate {
                return SampleLevel {
                    severity: AlertSeverity::Warning,
                    metric: AlertMetric::SuccessRate,
                    value: rate,
                };
            }
        }

        if snapshot.average_execution_time_ms > t.max_average_execution_time_ms {
            return SampleLevel {
                severity: AlertSeverity::Warning,
                metric: AlertMetric::AverageExecutionTime,
                value: snapshot.average_execution_time_ms,
            };
        }

        SampleLevel {
            severity: AlertSeverity::None,
            metric: AlertMetric::SuccessRate,
            value: rate,
        }
    }

    /// Fold a sample into the agent's state; returns the change, if any, and
    /// publishes it.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Option<AlertChange> {
        let level = self.classify(snapshot);
        let change = {
            let mut trackers = match self.trackers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let tracker = trackers
                .entry(snapshot.agent_id)
                .or_insert_with(|| Tracker::new(snapshot.agent_id));
            self.apply(tracker, level)
        };

        if let Some(change) = &change {
            if change.is_escalation() {
                warn!(
                    agent_id = %change.agent_id,
                    from = %change.previous,
                    to = %change.severity,
                    value = change.value,
                    "Alert escalated"
                );
            } else {
                info!(
                    agent_id = %change.agent_id,
                    from = %change.previous,
                    to = %change.severity,
                    "Alert recovered"
                );
            }
            self.event_bus
                .publish(EventPayload::AlertChanged(change.clone()));
        }
        change
    }

    fn apply(&self, tracker: &mut Tracker, level: SampleLevel) -> Option<AlertChange> {
        let current = tracker.state.severity;

        let target = if level.severity > current {
            tracker.clean_streak = 0;
            tracker.clean_ceiling = AlertSeverity::None;
            tracker.breach_streak += 1;
            tracker.breach_floor = tracker.breach_floor.min(level.severity);
            (tracker.breach_streak >= self.thresholds.consecutive_breaches_to_escalate)
                .then_some(tracker.breach_floor)
        } else if level.severity < current {
            tracker.breach_streak = 0;
            tracker.breach_floor = AlertSeverity::Critical;
            tracker.clean_streak += 1;
            tracker.clean_ceiling = tracker.clean_ceiling.max(level.severity);
            (tracker.clean_streak >= self.thresholds.consecutive_clean_to_recover)
                .then_some(tracker.clean_ceiling)
        } else {
            tracker.reset_streaks();
            None
        };

        let Some(severity) = target else {
            debug!(
                agent_id = %tracker.state.agent_id,
                level = %level.severity,
                current = %current,
                breach_streak = tracker.breach_streak,
                clean_streak = tracker.clean_streak,
                "Alert sample evaluated"
            );
            return None;
        };

        let now = Utc::now();
        tracker.state = AlertState {
            agent_id: tracker.state.agent_id,
            severity,
            metric: level.metric,
            value: level.value,
            entered_at: now,
        };
        tracker.reset_streaks();

        Some(AlertChange {
            agent_id: tracker.state.agent_id,
            previous: current,
            severity,
            metric: level.metric,
            value: level.value,
            timestamp: now,
        })
    }

    pub fn state(&self, agent_id: AgentId) -> Option<AlertState> {
        self.trackers
            .lock()
            .ok()
            .and_then(|t| t.get(&agent_id).map(|tracker| tracker.state.clone()))
    }

    /// Agents currently above `none`.
    pub fn active_alerts(&self) -> Vec<AlertState> {
        let Ok(trackers) = self.trackers.lock() else {
            return Vec::new();
        };
        let mut alerts: Vec<AlertState> = trackers
            .values()
            .filter(|t| t.state.severity > AlertSeverity::None)
            .map(|t| t.state.clone())
            .collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.entered_at.cmp(&b.entered_at)));
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RawCounters;
    use uuid::Uuid;

    fn engine(thresholds: AlertThresholds) -> AlertEngine {
        AlertEngine::new(thresholds, Arc::new(EventBus::new(64)))
    }

    fn sample(agent_id: AgentId, total: u64, successful: u64, avg: f64) -> MetricsSnapshot {
        MetricsSnapshot::from_counters(
            agent_id,
            RawCounters {
                total_executions: total,
                successful_executions: successful,
                failed_executions: total - successful,
                average_execution_time_ms: avg,
            },
        )
    }

    #[test]
    fn test_classification() {
        let engine = engine(AlertThresholds::default());
        let agent = Uuid::new_v4();

        let level = engine.classify(&sample(agent, 10, 7, 10.0));
        assert_eq!(level.severity, AlertSeverity::Warning);
        assert_eq!(level.metric, AlertMetric::SuccessRate);
        assert!((level.value - 0.7).abs() < 1e-9);

        assert_eq!(
            engine.classify(&sample(agent, 10, 4, 10.0)).severity,
            AlertSeverity::Critical
        );
        assert_eq!(
            engine.classify(&sample(agent, 10, 10, 10.0)).severity,
            AlertSeverity::None
        );

        let slow = engine.classify(&sample(agent, 10, 10, 45_000.0));
        assert_eq!(slow.severity, AlertSeverity::Warning);
        assert_eq!(slow.metric, AlertMetric::AverageExecutionTime);
    }

    #[test]
    fn test_idle_agent_skips_rate_check() {
        let engine = engine(AlertThresholds::default());
        let agent = Uuid::new_v4();
        assert_eq!(
            engine.classify(&sample(agent, 0, 0, 0.0)).severity,
            AlertSeverity::None
        );
    }

    #[test]
    fn test_escalation_requires_consecutive_breaches() {
        let engine = engine(AlertThresholds::default());
        let agent = Uuid::new_v4();
        let breach = sample(agent, 10, 7, 10.0);
        let clean = sample(agent, 10, 10, 10.0);

        assert!(engine.evaluate(&breach).is_none());
        assert!(engine.evaluate(&breach).is_none());
        assert!(engine.evaluate(&clean).is_none());
        assert!(engine.evaluate(&breach).is_none());
        assert!(engine.evaluate(&breach).is_none());

        let change = engine.evaluate(&breach).expect("third breach escalates");
        assert_eq!(change.previous, AlertSeverity::None);
        assert_eq!(change.severity, AlertSeverity::Warning);
        assert!(engine.evaluate(&breach).is_none());
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn test_escalates_to_lowest_sustained_level() {
        let engine = engine(AlertThresholds::default());
        let agent = Uuid::new_v4();
        let warning = sample(agent, 10, 7, 10.0);
        let critical = sample(agent, 10, 2, 10.0);

        engine.evaluate(&critical);
        engine.evaluate(&warning);
        let change = engine.evaluate(&critical).unwrap();
        assert_eq!(change.severity, AlertSeverity::Warning);

        engine.evaluate(&critical);
        engine.evaluate(&critical);
        let change = engine.evaluate(&critical).unwrap();
        assert_eq!(change.previous, AlertSeverity::Warning);
        assert_eq!(change.severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_recovery_to_highest_level_in_streak() {
        let thresholds = AlertThresholds {
            consecutive_breaches_to_escalate: 1,
            consecutive_clean_to_recover: 2,
            ..AlertThresholds::default()
        };
        let engine = engine(thresholds);
        let agent = Uuid::new_v4();

        let change = engine.evaluate(&sample(agent, 10, 1, 10.0)).unwrap();
        assert_eq!(change.severity, AlertSeverity::Critical);

        assert!(engine.evaluate(&sample(agent, 10, 10, 10.0)).is_none());
        let change = engine.evaluate(&sample(agent, 10, 7, 10.0)).unwrap();
        assert_eq!(change.previous, AlertSeverity::Critical);
        assert_eq!(change.severity, AlertSeverity::Warning);

        assert!(engine.evaluate(&sample(agent, 10, 10, 10.0)).is_none());
        let change = engine.evaluate(&sample(agent, 10, 10, 10.0)).unwrap();
        assert_eq!(change.severity, AlertSeverity::None);
        assert!(engine.active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_changes_are_published_once() {
        let bus = Arc::new(EventBus::new(64));
        let engine = AlertEngine::new(AlertThresholds::default(), bus.clone());
        let mut rx = bus.subscribe();
        let agent = Uuid::new_v4();

        for _ in 0..5 {
            engine.evaluate(&sample(agent, 10, 7, 10.0));
        }

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "alert:changed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(AlertEngine::validate_thresholds(&AlertThresholds::default()).is_ok());
        let inverted = AlertThresholds {
            warning_success_rate: 0.4,
            critical_success_rate: 0.6,
            ..AlertThresholds::default()
        };
        assert!(AlertEngine::validate_thresholds(&inverted).is_err());
        let zero_streak = AlertThresholds {
            consecutive_breaches_to_escalate: 0,
            ..AlertThresholds::default()
        };
        assert!(AlertEngine::validate_thresholds(&zero_streak).is_err());
    }
}
