//! Metrik-Schnappschüsse
//!
//! Ein `QualityMetricsSnapshot` wird einmal pro Zyklus gebaut und danach
//! nicht mehr verändert. Die Historie hält `Arc`s darauf, Leser bekommen
//! Kopien der `Arc`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Audio,
    Network,
    Processing,
    Translation,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 4] = [
        MetricCategory::Audio,
        MetricCategory::Network,
        MetricCategory::Processing,
        MetricCategory::Translation,
    ];
}

impl std::fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetricCategory::Audio => "audio",
            MetricCategory::Network => "network",
            MetricCategory::Processing => "processing",
            MetricCategory::Translation => "translation",
        };
        f.write_str(name)
    }
}

/// Pegel in 0.0 - 1.0, `signal_to_noise` in dB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetrics {
    pub level: f64,
    pub noise: f64,
    pub signal_to_noise: f64,
    pub clarity: f64,
    pub distortion: f64,
}

impl Default for AudioMetrics {
    fn default() -> Self {
        Self {
            level: 0.0,
            noise: 0.0,
            signal_to_noise: 40.0,
            clarity: 1.0,
            distortion: 0.0,
        }
    }
}

/// `latency`/`jitter` in ms, `packet_loss` als Anteil, `bandwidth` in kbit/s
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub latency: f64,
    pub jitter: f64,
    pub packet_loss: f64,
    pub bandwidth: f64,
    /// 0.0 (ständige Abbrüche) - 1.0 (stabil)
    pub stability: f64,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            latency: 0.0,
            jitter: 0.0,
            packet_loss: 0.0,
            bandwidth: 512.0,
            stability: 1.0,
        }
    }
}

/// CPU/Memory in Prozent, `throughput` in Frames pro Sekunde
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub throughput: f64,
}

/// Alle Werte als Anteil 0.0 - 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationMetrics {
    pub accuracy: f64,
    pub confidence: f64,
    pub error_rate: f64,
}

impl Default for TranslationMetrics {
    fn default() -> Self {
        Self {
            accuracy: 1.0,
            confidence: 1.0,
            error_rate: 0.0,
        }
    }
}

/// Ergebnis eines einzelnen Collectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricSample {
    Audio(AudioMetrics),
    Network(NetworkMetrics),
    Processing(ProcessingMetrics),
    Translation(TranslationMetrics),
}

impl MetricSample {
    pub fn category(&self) -> MetricCategory {
        match self {
            MetricSample::Audio(_) => MetricCategory::Audio,
            MetricSample::Network(_) => MetricCategory::Network,
            MetricSample::Processing(_) => MetricCategory::Processing,
            MetricSample::Translation(_) => MetricCategory::Translation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetricsSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub audio: AudioMetrics,
    pub network: NetworkMetrics,
    pub processing: ProcessingMetrics,
    pub translation: TranslationMetrics,
    /// Kategorien, die in diesem Zyklus keinen neuen Wert geliefert haben
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<MetricCategory>,
}

impl QualityMetricsSnapshot {
    pub fn new(session_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            audio: AudioMetrics::default(),
            network: NetworkMetrics::default(),
            processing: ProcessingMetrics::default(),
            translation: TranslationMetrics::default(),
            stale: Vec::new(),
        }
    }

    /// Baut den nächsten Schnappschuss
    ///
    /// Kategorien ohne neuen Sample behalten die Werte des vorherigen
    /// Schnappschusses und werden als `stale` markiert.
    pub fn next(
        previous: Option<&QualityMetricsSnapshot>,
        session_id: &str,
        timestamp: DateTime<Utc>,
        samples: &[MetricSample],
    ) -> Self {
        let mut snapshot = match previous {
            Some(prev) => Self {
                timestamp,
                stale: Vec::new(),
                ..prev.clone()
            },
            None => Self::new(session_id, timestamp),
        };

        for category in MetricCategory::ALL {
            if !samples.iter().any(|s| s.category() == category) {
                snapshot.stale.push(category);
            }
        }

        for sample in samples {
            match *sample {
                MetricSample::Audio(m) => snapshot.audio = m,
                MetricSample::Network(m) => snapshot.network = m,
                MetricSample::Processing(m) => snapshot.processing = m,
                MetricSample::Translation(m) => snapshot.translation = m,
            }
        }
        snapshot
    }

    pub fn is_stale(&self, category: MetricCategory) -> bool {
        self.stale.contains(&category)
    }

    pub fn read(&self, field: MetricField) -> f64 {
        field.read(self)
    }
}

// ============================================================================
// METRIC FIELDS
// ============================================================================

/// Adressiert ein einzelnes Feld eines Schnappschusses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricField {
    AudioLevel,
    Noise,
    SignalToNoise,
    Clarity,
    Distortion,
    Latency,
    Jitter,
    PacketLoss,
    Bandwidth,
    Stability,
    CpuUsage,
    MemoryUsage,
    Throughput,
    Accuracy,
    Confidence,
    ErrorRate,
}

impl MetricField {
    pub const ALL: [MetricField; 16] = [
        MetricField::AudioLevel,
        MetricField::Noise,
        MetricField::SignalToNoise,
        MetricField::Clarity,
        MetricField::Distortion,
        MetricField::Latency,
        MetricField::Jitter,
        MetricField::PacketLoss,
        MetricField::Bandwidth,
        MetricField::Stability,
        MetricField::CpuUsage,
        MetricField::MemoryUsage,
        MetricField::Throughput,
        MetricField::Accuracy,
        MetricField::Confidence,
        MetricField::ErrorRate,
    ];

    pub fn read(self, snapshot: &QualityMetricsSnapshot) -> f64 {
        match self {
            MetricField::AudioLevel => snapshot.audio.level,
            MetricField::Noise => snapshot.audio.noise,
            MetricField::SignalToNoise => snapshot.audio.signal_to_noise,
            MetricField::Clarity => snapshot.audio.clarity,
            MetricField::Distortion => snapshot.audio.distortion,
            MetricField::Latency => snapshot.network.latency,
            MetricField::Jitter => snapshot.network.jitter,
            MetricField::PacketLoss => snapshot.network.packet_loss,
            MetricField::Bandwidth => snapshot.network.bandwidth,
            MetricField::Stability => snapshot.network.stability,
            MetricField::CpuUsage => snapshot.processing.cpu_usage,
            MetricField::MemoryUsage => snapshot.processing.memory_usage,
            MetricField::Throughput => snapshot.processing.throughput,
            MetricField::Accuracy => snapshot.translation.accuracy,
            MetricField::Confidence => snapshot.translation.confidence,
            MetricField::ErrorRate => snapshot.translation.error_rate,
        }
    }

    pub fn category(self) -> MetricCategory {
        match self {
            MetricField::AudioLevel
            | MetricField::Noise
            | MetricField::SignalToNoise
            | MetricField::Clarity
            | MetricField::Distortion => MetricCategory::Audio,
            MetricField::Latency
            | MetricField::Jitter
            | MetricField::PacketLoss
            | MetricField::Bandwidth
            | MetricField::Stability => MetricCategory::Network,
            MetricField::CpuUsage | MetricField::MemoryUsage | MetricField::Throughput => {
                MetricCategory::Processing
            }
            MetricField::Accuracy | MetricField::Confidence | MetricField::ErrorRate => {
                MetricCategory::Translation
            }
        }
    }

    /// Ob ein höherer Wert eine bessere Qualität bedeutet
    pub fn higher_is_better(self) -> bool {
        matches!(
            self,
            MetricField::AudioLevel
                | MetricField::SignalToNoise
                | MetricField::Clarity
                | MetricField::Bandwidth
                | MetricField::Stability
                | MetricField::Throughput
                | MetricField::Accuracy
                | MetricField::Confidence
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricField::AudioLevel => "audioLevel",
            MetricField::Noise => "noise",
            MetricField::SignalToNoise => "signalToNoise",
            MetricField::Clarity => "clarity",
            MetricField::Distortion => "distortion",
            MetricField::Latency => "latency",
            MetricField::Jitter => "jitter",
            MetricField::PacketLoss => "packetLoss",
            MetricField::Bandwidth => "bandwidth",
            MetricField::Stability => "stability",
            MetricField::CpuUsage => "cpuUsage",
            MetricField::MemoryUsage => "memoryUsage",
            MetricField::Throughput => "throughput",
            MetricField::Accuracy => "accuracy",
            MetricField::Confidence => "confidence",
            MetricField::ErrorRate => "errorRate",
        }
    }
}

impl std::fmt::Display for MetricField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
