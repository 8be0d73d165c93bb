//! Qualitäts-Score
//!
//! Jede Kategorie wird monoton auf 0 - 100 abgebildet, der Gesamtscore ist
//! die gewichtete Mischung der vier Teil-Scores.

use super::metrics::{
    AudioMetrics, NetworkMetrics, ProcessingMetrics, QualityMetricsSnapshot, TranslationMetrics,
};
use crate::config::ScoreWeights;
use serde::{Deserialize, Serialize};

/// Bandbreite, ab der kein Abzug mehr erfolgt (kbit/s)
const BANDWIDTH_COMFORT_KBPS: f64 = 128.0;
/// Last in Prozent, ab der Processing-Abzüge beginnen
const LOAD_COMFORT_PERCENT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityGrade {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityGrade {
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            QualityGrade::Excellent
        } else if score >= 70.0 {
            QualityGrade::Good
        } else if score >= 50.0 {
            QualityGrade::Fair
        } else {
            QualityGrade::Poor
        }
    }
}

impl std::fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityGrade::Poor => "poor",
            QualityGrade::Fair => "fair",
            QualityGrade::Good => "good",
            QualityGrade::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScore {
    pub overall: f64,
    pub audio: f64,
    pub network: f64,
    pub processing: f64,
    pub translation: f64,
    pub grade: QualityGrade,
}

impl QualityScore {
    pub fn compute(snapshot: &QualityMetricsSnapshot, weights: &ScoreWeights) -> Self {
        let audio = audio_score(&snapshot.audio);
        let network = network_score(&snapshot.network);
        let processing = processing_score(&snapshot.processing);
        let translation = translation_score(&snapshot.translation);

        let total = weights.total();
        let overall = if total > 0.0 {
            (weights.audio * audio
                + weights.network * network
                + weights.processing * processing
                + weights.translation * translation)
                / total
        } else {
            0.0
        };
        let overall = overall.clamp(0.0, 100.0);

        Self {
            overall,
            audio,
            network,
            processing,
            translation,
            grade: QualityGrade::from_score(overall),
        }
    }
}

fn unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// NaN und Unendlich zählen als fehlender Wert, es gilt der Ausgangswert
fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

pub fn audio_score(m: &AudioMetrics) -> f64 {
    let d = AudioMetrics::default();
    let score = 40.0 * unit(finite_or(m.signal_to_noise, d.signal_to_noise) / 40.0)
        + 40.0 * unit(finite_or(m.clarity, d.clarity))
        + 20.0 * (1.0 - unit(finite_or(m.distortion, d.distortion)))
        - 20.0 * unit(finite_or(m.noise, d.noise) * 10.0);
    score.clamp(0.0, 100.0)
}

/// Latenz, Jitter und Verlust werden additiv abgezogen
pub fn network_score(m: &NetworkMetrics) -> f64 {
    let d = NetworkMetrics::default();
    let bandwidth = finite_or(m.bandwidth, d.bandwidth);
    let bandwidth_deficit = unit((BANDWIDTH_COMFORT_KBPS - bandwidth) / BANDWIDTH_COMFORT_KBPS);
    let score = 100.0
        - finite_or(m.latency, d.latency).max(0.0) / 10.0
        - finite_or(m.jitter, d.jitter).max(0.0) / 2.0
        - unit(finite_or(m.packet_loss, d.packet_loss)) * 500.0
        - bandwidth_deficit * 20.0
        - (1.0 - unit(finite_or(m.stability, d.stability))) * 10.0;
    score.clamp(0.0, 100.0)
}

pub fn processing_score(m: &ProcessingMetrics) -> f64 {
    let d = ProcessingMetrics::default();
    let cpu_penalty = (finite_or(m.cpu_usage, d.cpu_usage) - LOAD_COMFORT_PERCENT).max(0.0);
    let memory_penalty =
        (finite_or(m.memory_usage, d.memory_usage) - LOAD_COMFORT_PERCENT).max(0.0) * 0.8;
    (100.0 - cpu_penalty - memory_penalty).clamp(0.0, 100.0)
}

pub fn translation_score(m: &TranslationMetrics) -> f64 {
    let d = TranslationMetrics::default();
    let score = 40.0 * unit(finite_or(m.accuracy, d.accuracy))
        + 40.0 * unit(finite_or(m.confidence, d.confidence))
        + 20.0 * (1.0 - unit(finite_or(m.error_rate, d.error_rate)));
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> QualityMetricsSnapshot {
        QualityMetricsSnapshot::new("s1", Utc::now())
    }

    #[test]
    fn test_defaults_score_excellent() {
        let score = QualityScore::compute(&snapshot(), &ScoreWeights::default());
        assert!(score.overall > 90.0);
        assert_eq!(score.grade, QualityGrade::Excellent);
    }

    #[test]
    fn test_latency_never_increases_score() {
        let weights = ScoreWeights::default();
        let mut previous = f64::MAX;
        for latency in (0..3000).step_by(25) {
            let mut s = snapshot();
            s.network.latency = latency as f64;
            let score = QualityScore::compute(&s, &weights).overall;
            assert!(score <= previous, "latency {} raised the score", latency);
            previous = score;
        }
    }

    #[test]
    fn test_monotonic_directions() {
        let weights = ScoreWeights::default();
        let base = QualityScore::compute(&snapshot(), &weights).overall;

        let mut worse = snapshot();
        worse.network.jitter = 40.0;
        worse.network.packet_loss = 0.02;
        worse.audio.distortion = 0.3;
        worse.translation.error_rate = 0.2;
        assert!(QualityScore::compute(&worse, &weights).overall < base);

        let mut low_bw = snapshot();
        low_bw.network.bandwidth = 32.0;
        let mut high_bw = low_bw.clone();
        high_bw.network.bandwidth = 96.0;
        assert!(
            QualityScore::compute(&high_bw, &weights).overall
                >= QualityScore::compute(&low_bw, &weights).overall
        );
    }

    #[test]
    fn test_network_score_floors_at_zero() {
        let m = NetworkMetrics {
            latency: 5000.0,
            packet_loss: 0.5,
            ..Default::default()
        };
        assert_eq!(network_score(&m), 0.0);
    }

    #[test]
    fn test_weights_are_normalized() {
        let mut s = snapshot();
        s.processing.cpu_usage = 100.0;
        s.processing.memory_usage = 100.0;
        let only_processing = ScoreWeights {
            audio: 0.0,
            network: 0.0,
            processing: 2.0,
            translation: 0.0,
        };
        let score = QualityScore::compute(&s, &only_processing);
        assert_eq!(score.overall, score.processing);
        assert_eq!(score.processing, 10.0);
    }

    #[test]
    fn test_non_finite_metrics_count_as_missing() {
        let weights = ScoreWeights::default();
        let base = QualityScore::compute(&snapshot(), &weights);

        let mut s = snapshot();
        s.network.latency = f64::NAN;
        s.network.packet_loss = f64::INFINITY;
        s.audio.signal_to_noise = f64::NAN;
        s.processing.cpu_usage = f64::NEG_INFINITY;
        s.translation.confidence = f64::NAN;
        let score = QualityScore::compute(&s, &weights);

        assert!(score.overall.is_finite());
        assert_eq!(score, base);
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(QualityGrade::from_score(85.0), QualityGrade::Excellent);
        assert_eq!(QualityGrade::from_score(70.0), QualityGrade::Good);
        assert_eq!(QualityGrade::from_score(69.9), QualityGrade::Fair);
        assert_eq!(QualityGrade::from_score(10.0), QualityGrade::Poor);
        assert!(QualityGrade::Good > QualityGrade::Fair);
    }
}
