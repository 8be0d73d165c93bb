//! Optimierungsregeln und Empfehlungen
//!
//! Eine Regel ist ein Prädikat über den Schnappschuss plus Empfehlungstext,
//! Action-Tag und Priorität. Alle passenden Regeln liefern eine Empfehlung,
//! die Auswertung selbst kennt keine einzelne Regel.

use super::metrics::{MetricField, QualityMetricsSnapshot};
use super::trend::{field_trend, is_worsening, TrendDirection};
use crate::config::QualityConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionTag {
    IncreaseBuffer,
    ReduceBuffer,
    LowerQuality,
    ReduceProcessing,
    EnableNoiseSuppression,
    ImproveTranslation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Beobachtete Metrik verbessert sich bereits
    Low,
    Normal,
    /// Beobachtete Metrik verschlechtert sich weiter
    Elevated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Greater,
    Less,
}

pub type PredicateFn = Arc<dyn Fn(&QualityMetricsSnapshot) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum RulePredicate {
    /// Vergleich eines Felds; ein Feld ohne neuen Wert in diesem Zyklus passt nie
    Field {
        field: MetricField,
        comparison: Comparison,
        value: f64,
    },
    All(Vec<RulePredicate>),
    Any(Vec<RulePredicate>),
    Custom(PredicateFn),
}

impl RulePredicate {
    pub fn greater(field: MetricField, value: f64) -> Self {
        RulePredicate::Field {
            field,
            comparison: Comparison::Greater,
            value,
        }
    }

    pub fn less(field: MetricField, value: f64) -> Self {
        RulePredicate::Field {
            field,
            comparison: Comparison::Less,
            value,
        }
    }

    pub fn matches(&self, snapshot: &QualityMetricsSnapshot) -> bool {
        match self {
            RulePredicate::Field {
                field,
                comparison,
                value,
            } => {
                if snapshot.is_stale(field.category()) {
                    return false;
                }
                let measured = field.read(snapshot);
                match comparison {
                    Comparison::Greater => measured > *value,
                    Comparison::Less => measured < *value,
                }
            }
            RulePredicate::All(predicates) => predicates.iter().all(|p| p.matches(snapshot)),
            RulePredicate::Any(predicates) => predicates.iter().any(|p| p.matches(snapshot)),
            RulePredicate::Custom(f) => f(snapshot),
        }
    }
}

impl std::fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulePredicate::Field {
                field,
                comparison,
                value,
            } => write!(f, "{} {:?} {}", field, comparison, value),
            RulePredicate::All(p) => f.debug_tuple("All").field(p).finish(),
            RulePredicate::Any(p) => f.debug_tuple("Any").field(p).finish(),
            RulePredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationRule {
    pub name: String,
    pub predicate: RulePredicate,
    pub recommendation: String,
    pub action: ActionTag,
    pub priority: Priority,
    /// Metrik, deren Trend die Dringlichkeit bestimmt
    pub watch: Option<MetricField>,
}

impl OptimizationRule {
    pub fn new(
        name: impl Into<String>,
        predicate: RulePredicate,
        recommendation: impl Into<String>,
        action: ActionTag,
        priority: Priority,
    ) -> Self {
        Self {
            name: name.into(),
            predicate,
            recommendation: recommendation.into(),
            action,
            priority,
            watch: None,
        }
    }

    pub fn watching(mut self, field: MetricField) -> Self {
        self.watch = Some(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub rule: String,
    pub recommendation: String,
    pub action: ActionTag,
    pub priority: Priority,
    pub urgency: Urgency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendDirection>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Standard-Regeln mit den Auslösern aus `quality.rules`
pub fn default_rules(config: &QualityConfig) -> Vec<OptimizationRule> {
    let thresholds = &config.rules;
    vec![
        OptimizationRule::new(
            "high-latency",
            RulePredicate::greater(MetricField::Latency, thresholds.latency),
            "Reduce buffering to bring end-to-end latency down",
            ActionTag::ReduceBuffer,
            Priority::High,
        )
        .watching(MetricField::Latency),
        OptimizationRule::new(
            "packet-loss",
            RulePredicate::greater(MetricField::PacketLoss, thresholds.packet_loss),
            "Lower the stream quality to reduce packet loss",
            ActionTag::LowerQuality,
            Priority::High,
        )
        .watching(MetricField::PacketLoss),
        OptimizationRule::new(
            "high-jitter",
            RulePredicate::greater(MetricField::Jitter, thresholds.jitter),
            "Increase the buffer to absorb jitter",
            ActionTag::IncreaseBuffer,
            Priority::Medium,
        )
        .watching(MetricField::Jitter),
        OptimizationRule::new(
            "high-cpu",
            RulePredicate::greater(MetricField::CpuUsage, thresholds.cpu_usage),
            "Reduce audio processing load",
            ActionTag::ReduceProcessing,
            Priority::Medium,
        )
        .watching(MetricField::CpuUsage),
        OptimizationRule::new(
            "low-snr",
            RulePredicate::less(MetricField::SignalToNoise, thresholds.signal_to_noise),
            "Enable noise suppression",
            ActionTag::EnableNoiseSuppression,
            Priority::Low,
        )
        .watching(MetricField::SignalToNoise),
        OptimizationRule::new(
            "low-translation-confidence",
            RulePredicate::less(MetricField::Confidence, thresholds.confidence),
            "Improve translation input or switch the translation model",
            ActionTag::ImproveTranslation,
            Priority::Low,
        )
        .watching(MetricField::Confidence),
        OptimizationRule::new(
            "low-bandwidth",
            RulePredicate::less(MetricField::Bandwidth, thresholds.min_bandwidth),
            "Lower the stream quality to fit the available bandwidth",
            ActionTag::LowerQuality,
            Priority::High,
        )
        .watching(MetricField::Bandwidth),
    ]
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<OptimizationRule>,
    trend_window: usize,
}

impl RuleSet {
    pub fn new(rules: Vec<OptimizationRule>, trend_window: usize) -> Self {
        Self {
            rules,
            trend_window,
        }
    }

    pub fn add(&mut self, rule: OptimizationRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[OptimizationRule] {
        &self.rules
    }

    /// Wertet alle Regeln gegen den neuesten Schnappschuss der Historie aus
    ///
    /// Ergebnis ist nach Priorität absteigend sortiert.
    pub fn evaluate(
        &self,
        history: &VecDeque<Arc<QualityMetricsSnapshot>>,
    ) -> Vec<Recommendation> {
        let Some(latest) = history.back() else {
            return Vec::new();
        };

        let mut out: Vec<Recommendation> = self
            .rules
            .iter()
            .filter(|rule| rule.predicate.matches(latest))
            .map(|rule| {
                let trend = rule
                    .watch
                    .and_then(|field| field_trend(history, field, self.trend_window));
                let urgency = match (rule.watch, trend) {
                    (Some(field), Some(t)) if is_worsening(field, t) => Urgency::Elevated,
                    (Some(_), Some(TrendDirection::Stable)) | (_, None) => Urgency::Normal,
                    (None, Some(_)) => Urgency::Normal,
                    (Some(_), Some(_)) => Urgency::Low,
                };
                Recommendation {
                    rule: rule.name.clone(),
                    recommendation: rule.recommendation.clone(),
                    action: rule.action,
                    priority: rule.priority,
                    urgency,
                    trend,
                    session_id: latest.session_id.clone(),
                    timestamp: latest.timestamp,
                }
            })
            .collect();

        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }
}
