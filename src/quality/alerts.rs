//! Schwellwert-Auswertung und Alarme
//!
//! Die Schwellwerte sind eine Tabelle aus `ThresholdRule`s, die jeden
//! Zyklus gegen den neuesten Schnappschuss geprüft werden. Pro
//! (Session, Alarmtyp) gilt ein Cooldown ab der letzten Auslösung.

use super::metrics::{MetricField, QualityMetricsSnapshot};
use crate::config::QualityThresholds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertType {
    Latency,
    Jitter,
    PacketLoss,
    CpuUsage,
    MemoryUsage,
    SignalToNoise,
    Confidence,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertType::Latency => "latency",
            AlertType::Jitter => "jitter",
            AlertType::PacketLoss => "packetLoss",
            AlertType::CpuUsage => "cpuUsage",
            AlertType::MemoryUsage => "memoryUsage",
            AlertType::SignalToNoise => "signalToNoise",
            AlertType::Confidence => "confidence",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    /// Alarm, wenn der Wert den Schwellwert übersteigt
    Above,
    /// Alarm, wenn der Wert den Schwellwert unterschreitet
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub measured_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRule {
    pub alert_type: AlertType,
    pub field: MetricField,
    pub direction: ThresholdDirection,
    pub threshold: f64,
}

impl ThresholdRule {
    pub fn above(alert_type: AlertType, field: MetricField, threshold: f64) -> Self {
        Self {
            alert_type,
            field,
            direction: ThresholdDirection::Above,
            threshold,
        }
    }

    pub fn below(alert_type: AlertType, field: MetricField, threshold: f64) -> Self {
        Self {
            alert_type,
            field,
            direction: ThresholdDirection::Below,
            threshold,
        }
    }

    pub fn is_breached(&self, value: f64) -> bool {
        match self.direction {
            ThresholdDirection::Above => value > self.threshold,
            ThresholdDirection::Below => value < self.threshold,
        }
    }

    pub fn severity(&self, value: f64, critical_factor: f64) -> AlertSeverity {
        let critical = match self.direction {
            ThresholdDirection::Above => value > self.threshold * critical_factor,
            ThresholdDirection::Below => value < self.threshold / critical_factor,
        };
        if critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

/// Standard-Tabelle aus den konfigurierten Schwellwerten
pub fn threshold_rules(thresholds: &QualityThresholds) -> Vec<ThresholdRule> {
    vec![
        ThresholdRule::above(AlertType::Latency, MetricField::Latency, thresholds.latency),
        ThresholdRule::above(AlertType::Jitter, MetricField::Jitter, thresholds.jitter),
        ThresholdRule::above(
            AlertType::PacketLoss,
            MetricField::PacketLoss,
            thresholds.packet_loss,
        ),
        ThresholdRule::above(AlertType::CpuUsage, MetricField::CpuUsage, thresholds.cpu_usage),
        ThresholdRule::above(
            AlertType::MemoryUsage,
            MetricField::MemoryUsage,
            thresholds.memory_usage,
        ),
        ThresholdRule::below(
            AlertType::SignalToNoise,
            MetricField::SignalToNoise,
            thresholds.signal_to_noise,
        ),
        ThresholdRule::below(
            AlertType::Confidence,
            MetricField::Confidence,
            thresholds.confidence,
        ),
    ]
}

// ============================================================================
// ALERT EVALUATOR
// ============================================================================

pub struct AlertEvaluator {
    rules: Vec<ThresholdRule>,
    critical_factor: f64,
    cooldown: Duration,
    last_emitted: HashMap<(String, AlertType), DateTime<Utc>>,
}

impl AlertEvaluator {
    pub fn new(thresholds: &QualityThresholds, cooldown: Duration) -> Self {
        Self::with_rules(threshold_rules(thresholds), thresholds.critical_factor, cooldown)
    }

    pub fn with_rules(rules: Vec<ThresholdRule>, critical_factor: f64, cooldown: Duration) -> Self {
        Self {
            rules,
            critical_factor: critical_factor.max(1.0),
            cooldown,
            last_emitted: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Prüft alle Schwellwerte gegen den Schnappschuss
    ///
    /// Kategorien ohne neuen Wert in diesem Zyklus werden übersprungen.
    pub fn evaluate(&mut self, snapshot: &QualityMetricsSnapshot) -> Vec<AlertRecord> {
        let now = snapshot.timestamp;
        let mut alerts = Vec::new();

        for rule in &self.rules {
            if snapshot.is_stale(rule.field.category()) {
                continue;
            }
            let value = rule.field.read(snapshot);
            if !rule.is_breached(value) {
                continue;
            }

            let key = (snapshot.session_id.clone(), rule.alert_type);
            if let Some(last) = self.last_emitted.get(&key) {
                // Zeitstempel vor der letzten Auslösung zählt als innerhalb des Cooldowns
                let within_cooldown = match (now - *last).to_std() {
                    Ok(elapsed) => elapsed < self.cooldown,
                    Err(_) => true,
                };
                if within_cooldown {
                    tracing::trace!(
                        session_id = %snapshot.session_id,
                        "Alert {} suppressed by cooldown",
                        rule.alert_type
                    );
                    continue;
                }
            }

            let severity = rule.severity(value, self.critical_factor);
            let comparison = match rule.direction {
                ThresholdDirection::Above => "above",
                ThresholdDirection::Below => "below",
            };
            alerts.push(AlertRecord {
                alert_type: rule.alert_type,
                severity,
                message: format!(
                    "{} is {} threshold: {:.3} (threshold {:.3})",
                    rule.field, comparison, value, rule.threshold
                ),
                measured_value: value,
                threshold: rule.threshold,
                timestamp: now,
                session_id: snapshot.session_id.clone(),
            });
            self.last_emitted.insert(key, now);
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn breaching(at: DateTime<Utc>) -> QualityMetricsSnapshot {
        let mut s = QualityMetricsSnapshot::new("s1", at);
        s.network.latency = 350.0;
        s.network.packet_loss = 0.08;
        s
    }

    #[test]
    fn test_latency_and_loss_scenario() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let alerts = evaluator.evaluate(&breaching(Utc::now()));

        assert_eq!(alerts.len(), 2);
        let latency = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::Latency)
            .unwrap();
        assert_eq!(latency.severity, AlertSeverity::Warning);
        assert_eq!(latency.measured_value, 350.0);
        assert_eq!(latency.threshold, 200.0);

        let loss = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::PacketLoss)
            .unwrap();
        assert_eq!(loss.severity, AlertSeverity::Warning);
        assert_eq!(loss.session_id, "s1");
    }

    #[test]
    fn test_cooldown_suppresses_sustained_breach() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let t0 = Utc::now();

        let mut latency_alerts = 0;
        for i in 0..10 {
            let alerts = evaluator.evaluate(&breaching(t0 + ChronoDuration::seconds(i)));
            latency_alerts += alerts
                .iter()
                .filter(|a| a.alert_type == AlertType::Latency)
                .count();
        }
        assert_eq!(latency_alerts, 1);

        // Nach Ablauf des Cooldowns wieder
        let alerts = evaluator.evaluate(&breaching(t0 + ChronoDuration::seconds(31)));
        assert_eq!(alerts.len(), 2);
    }

    #[test]
    fn test_back_dated_snapshot_is_suppressed() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let t0 = Utc::now();
        assert_eq!(evaluator.evaluate(&breaching(t0)).len(), 2);
        assert!(evaluator
            .evaluate(&breaching(t0 - ChronoDuration::seconds(60)))
            .is_empty());
    }

    #[test]
    fn test_cooldown_is_per_session() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let t0 = Utc::now();
        assert_eq!(evaluator.evaluate(&breaching(t0)).len(), 2);

        let mut other = breaching(t0);
        other.session_id = "s2".to_string();
        assert_eq!(evaluator.evaluate(&other).len(), 2);
    }

    #[test]
    fn test_critical_severity_and_below_rules() {
        let mut evaluator = AlertEvaluator::new(&QualityThresholds::default(), Duration::ZERO);
        let mut s = QualityMetricsSnapshot::new("s1", Utc::now());
        s.network.latency = 450.0;
        s.audio.signal_to_noise = 4.0;
        s.translation.confidence = 0.5;

        let alerts = evaluator.evaluate(&s);
        let severity = |t: AlertType| {
            alerts
                .iter()
                .find(|a| a.alert_type == t)
                .map(|a| a.severity)
        };
        assert_eq!(severity(AlertType::Latency), Some(AlertSeverity::Critical));
        assert_eq!(
            severity(AlertType::SignalToNoise),
            Some(AlertSeverity::Critical)
        );
        assert_eq!(severity(AlertType::Confidence), Some(AlertSeverity::Warning));
    }

    #[test]
    fn test_stale_category_is_not_evaluated() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let mut s = breaching(Utc::now());
        s.stale = vec![super::super::metrics::MetricCategory::Network];
        assert!(evaluator.evaluate(&s).is_empty());
    }

    #[test]
    fn test_alert_json_uses_type_key() {
        let mut evaluator =
            AlertEvaluator::new(&QualityThresholds::default(), Duration::from_secs(30));
        let alert = evaluator.evaluate(&breaching(Utc::now())).remove(0);
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "latency");
        assert_eq!(value["severity"], "warning");
        assert!(value.get("measuredValue").is_some());
    }
}
