//! Auswertungskern einer überwachten Session
//!
//! Ohne Tasks und Timer: der Engine-Worker ruft pro Zyklus `process` auf.
//! Hält Historie, Alarme und Empfehlungen, jeweils begrenzt.

use super::alerts::{AlertEvaluator, AlertRecord};
use super::collectors::CollectorError;
use super::metrics::{MetricSample, QualityMetricsSnapshot};
use super::rules::{default_rules, OptimizationRule, Recommendation, RuleSet};
use super::score::QualityScore;
use crate::config::QualityConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub score: QualityScore,
    pub snapshot: Arc<QualityMetricsSnapshot>,
}

/// Ergebnis eines Zyklus
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: QualityReport,
    pub alerts: Vec<AlertRecord>,
    pub recommendations: Vec<Recommendation>,
    pub degraded: Vec<CollectorError>,
}

pub struct QualityMonitor {
    session_id: String,
    history: VecDeque<Arc<QualityMetricsSnapshot>>,
    history_size: usize,
    alerts: VecDeque<AlertRecord>,
    max_alerts: usize,
    recommendations: VecDeque<Recommendation>,
    max_recommendations: usize,
    evaluator: AlertEvaluator,
    rules: RuleSet,
    weights: crate::config::ScoreWeights,
    latest: Option<QualityReport>,
}

impl QualityMonitor {
    pub fn new(session_id: impl Into<String>, config: &QualityConfig) -> Self {
        Self::with_rules(
            session_id,
            config,
            default_rules(config),
        )
    }

    pub fn with_rules(
        session_id: impl Into<String>,
        config: &QualityConfig,
        rules: Vec<OptimizationRule>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            history: VecDeque::with_capacity(config.history_size.min(1024)),
            history_size: config.history_size.max(1),
            alerts: VecDeque::new(),
            max_alerts: config.max_alerts.max(1),
            recommendations: VecDeque::new(),
            max_recommendations: config.max_recommendations.max(1),
            evaluator: AlertEvaluator::new(
                &config.thresholds,
                Duration::from_millis(config.alert_cooldown_ms),
            ),
            rules: RuleSet::new(rules, config.trend_window),
            weights: config.weights,
            latest: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Baut aus den Samples eines Zyklus den nächsten Schnappschuss und wertet ihn aus
    pub fn process(
        &mut self,
        samples: &[MetricSample],
        degraded: Vec<CollectorError>,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let snapshot = QualityMetricsSnapshot::next(
            self.history.back().map(|s| s.as_ref()),
            &self.session_id,
            now,
            samples,
        );
        let mut outcome = self.record(snapshot);
        outcome.degraded = degraded;
        outcome
    }

    /// Wertet einen fertigen Schnappschuss aus
    pub fn record(&mut self, snapshot: QualityMetricsSnapshot) -> CycleOutcome {
        let snapshot = Arc::new(snapshot);
        self.history.push_back(Arc::clone(&snapshot));
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }

        let score = QualityScore::compute(&snapshot, &self.weights);
        let alerts = self.evaluator.evaluate(&snapshot);
        let recommendations = self.rules.evaluate(&self.history);

        for alert in &alerts {
            self.alerts.push_back(alert.clone());
        }
        while self.alerts.len() > self.max_alerts {
            self.alerts.pop_front();
        }
        for rec in &recommendations {
            self.recommendations.push_back(rec.clone());
        }
        while self.recommendations.len() > self.max_recommendations {
            self.recommendations.pop_front();
        }

        let report = QualityReport {
            session_id: self.session_id.clone(),
            timestamp: snapshot.timestamp,
            score,
            snapshot,
        };
        self.latest = Some(report.clone());

        CycleOutcome {
            report,
            alerts,
            recommendations,
            degraded: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&QualityReport> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> Vec<Arc<QualityMetricsSnapshot>> {
        self.history.iter().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.iter().cloned().collect()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.recommendations.iter().cloned().collect()
    }

    /// Entnimmt alle angesammelten Empfehlungen
    pub fn take_recommendations(&mut self) -> Vec<Recommendation> {
        self.recommendations.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::metrics::{MetricCategory, NetworkMetrics};
    use chrono::Duration as ChronoDuration;

    fn config() -> QualityConfig {
        QualityConfig {
            history_size: 3,
            max_alerts: 4,
            max_recommendations: 3,
            ..Default::default()
        }
    }

    fn bad_network() -> MetricSample {
        MetricSample::Network(NetworkMetrics {
            latency: 350.0,
            packet_loss: 0.08,
            ..Default::default()
        })
    }

    #[test]
    fn test_history_is_bounded_oldest_first() {
        let mut monitor = QualityMonitor::new("s1", &config());
        let t0 = Utc::now();
        for i in 0..5 {
            let latency = 10.0 * i as f64;
            monitor.process(
                &[MetricSample::Network(NetworkMetrics {
                    latency,
                    ..Default::default()
                })],
                Vec::new(),
                t0 + ChronoDuration::seconds(i),
            );
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].network.latency, 20.0);
        assert_eq!(history[2].network.latency, 40.0);
    }

    #[test]
    fn test_cycle_produces_alerts_and_recommendations() {
        let mut monitor = QualityMonitor::new("s1", &config());
        let outcome = monitor.process(&[bad_network()], Vec::new(), Utc::now());

        assert_eq!(outcome.alerts.len(), 2);
        assert_eq!(outcome.recommendations.len(), 2);
        assert!(outcome.report.score.overall < 100.0);
        assert_eq!(monitor.latest().unwrap().session_id, "s1");
    }

    #[test]
    fn test_sustained_breach_alerts_once_but_recommends_every_cycle() {
        let mut monitor = QualityMonitor::new("s1", &config());
        let t0 = Utc::now();
        let mut alert_count = 0;
        for i in 0..5 {
            let outcome =
                monitor.process(&[bad_network()], Vec::new(), t0 + ChronoDuration::seconds(i));
            alert_count += outcome.alerts.len();
            assert_eq!(outcome.recommendations.len(), 2);
        }
        assert_eq!(alert_count, 2);
        assert_eq!(monitor.alerts().len(), 2);
        // Empfehlungsliste ist begrenzt
        assert_eq!(monitor.recommendations().len(), 3);
        assert_eq!(monitor.take_recommendations().len(), 3);
        assert!(monitor.recommendations().is_empty());
    }

    #[test]
    fn test_missing_category_is_not_zero() {
        let mut monitor = QualityMonitor::new("s1", &config());
        let t0 = Utc::now();
        monitor.process(&[bad_network()], Vec::new(), t0);
        let outcome = monitor.process(&[], Vec::new(), t0 + ChronoDuration::seconds(1));

        assert_eq!(outcome.report.snapshot.network.latency, 350.0);
        assert!(outcome.report.snapshot.stale.contains(&MetricCategory::Network));
        // Keine neuen Alarme aus veralteten Werten
        assert!(outcome.alerts.is_empty());
    }
}
