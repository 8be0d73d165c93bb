//! Quality-Stufen und Stepping-Regel
//!
//! Pro Anpassungszyklus wird höchstens eine Stufe gewechselt.

use crate::config::StreamingConfig;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl QualityLevel {
    pub fn step_up(self) -> Self {
        match self {
            QualityLevel::Low => QualityLevel::Medium,
            QualityLevel::Medium => QualityLevel::High,
            QualityLevel::High | QualityLevel::Ultra => QualityLevel::Ultra,
        }
    }

    pub fn step_down(self) -> Self {
        match self {
            QualityLevel::Ultra => QualityLevel::High,
            QualityLevel::High => QualityLevel::Medium,
            QualityLevel::Medium | QualityLevel::Low => QualityLevel::Low,
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityLevel::Low => "low",
            QualityLevel::Medium => "medium",
            QualityLevel::High => "high",
            QualityLevel::Ultra => "ultra",
        };
        f.write_str(name)
    }
}

/// Netzwerkzustand eines Streams, wie ihn die Quality Engine zuletzt gemessen hat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHealth {
    pub latency_ms: f64,
    pub packet_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Up,
    Down,
    Hold,
}

/// Entscheidet den nächsten Schritt
///
/// Ohne Netzwerkmessung zählt nur die Pufferlage; hochgeschaltet wird dann nie.
pub fn decide_step(
    network: Option<&NetworkHealth>,
    buffer_health: f64,
    config: &StreamingConfig,
) -> StepDecision {
    let Some(net) = network else {
        return if buffer_health < 50.0 {
            StepDecision::Down
        } else {
            StepDecision::Hold
        };
    };

    let score_too_low = net
        .quality_score
        .map(|score| score < config.min_quality_score)
        .unwrap_or(false);

    if net.latency_ms > config.max_latency_ms as f64
        || net.packet_loss >= config.packet_loss_high
        || buffer_health < 50.0
        || score_too_low
    {
        StepDecision::Down
    } else if net.latency_ms < config.target_latency_ms as f64
        && net.packet_loss <= config.packet_loss_low
        && buffer_health > 80.0
    {
        StepDecision::Up
    } else {
        StepDecision::Hold
    }
}

/// Pufferlage eines Intervalls, 0 - 100
pub fn buffer_health(underruns: u32, overflow_batches: u32) -> f64 {
    (100.0 - 25.0 * f64::from(underruns) - 15.0 * f64::from(overflow_batches)).clamp(0.0, 100.0)
}
