//! Quality Monitoring & Alerting
//!
//! - Schnappschüsse aus pull-basierten Collectors (mit Timeout pro Collector)
//! - gewichteter Score, Schwellwert-Alarme mit Cooldown
//! - tabellengesteuerte Optimierungsregeln mit Trend-Dringlichkeit

mod alerts;
mod collectors;
mod engine;
mod metrics;
mod monitor;
mod rules;
mod score;
mod trend;

pub use alerts::{
    threshold_rules, AlertEvaluator, AlertRecord, AlertSeverity, AlertType, ThresholdDirection,
    ThresholdRule,
};
pub use collectors::{
    collect_all, AudioLevelCollector, CollectorError, MetricCollector, NetworkStatsCollector,
    ProcessingCollector, TranslationStatsCollector,
};
pub use engine::{QualityEngine, QualityError, QualityEvent};
pub use metrics::{
    AudioMetrics, MetricCategory, MetricField, MetricSample, NetworkMetrics, ProcessingMetrics,
    QualityMetricsSnapshot, TranslationMetrics,
};
pub use monitor::{CycleOutcome, QualityMonitor, QualityReport};
pub use rules::{
    default_rules, ActionTag, Comparison, OptimizationRule, Priority, Recommendation,
    RulePredicate, RuleSet, Urgency,
};
pub use score::{QualityGrade, QualityScore};
pub use trend::{classify as classify_trend, TrendDirection};
