//! Trend-Erkennung über die letzten N Samples einer Metrik
//!
//! Lineare Regression über den Index. Wird nur zur Dringlichkeit von
//! Empfehlungen genutzt, nie für Alarme.

use super::metrics::{MetricField, QualityMetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Relative Steigung pro Sample, unter der ein Verlauf als stabil gilt
const STABLE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Declining,
    Stable,
}

/// Steigung der Regressionsgeraden (Einheit pro Sample)
pub fn slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}

pub fn classify(values: &[f64]) -> Option<TrendDirection> {
    let slope = slope(values)?;
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let tolerance = (mean.abs() * STABLE_TOLERANCE).max(1e-9);

    Some(if slope > tolerance {
        TrendDirection::Increasing
    } else if slope < -tolerance {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    })
}

/// Trend eines Felds über die letzten `window` Schnappschüsse
pub fn field_trend(
    history: &VecDeque<Arc<QualityMetricsSnapshot>>,
    field: MetricField,
    window: usize,
) -> Option<TrendDirection> {
    let skip = history.len().saturating_sub(window);
    let values: Vec<f64> = history.iter().skip(skip).map(|s| field.read(s)).collect();
    classify(&values)
}

/// Ob der Trend für dieses Feld eine Verschlechterung bedeutet
pub fn is_worsening(field: MetricField, trend: TrendDirection) -> bool {
    match trend {
        TrendDirection::Stable => false,
        TrendDirection::Increasing => !field.higher_is_better(),
        TrendDirection::Declining => field.higher_is_better(),
    }
}
