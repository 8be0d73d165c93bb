//! Metrik-Collectors
//!
//! Collectors sind pull-basiert: der Monitoring-Worker fragt jeden Zyklus
//! alle Collectors parallel ab, jeder mit eigenem Timeout. Ein Collector,
//! der nicht antwortet oder fehlschlägt, fällt nur für diesen Zyklus aus.
//!
//! Die mitgelieferten Collectors werden von außen gefüttert (RTT-Messungen,
//! PCM-Frames, Übersetzungsergebnisse) und verdichten ihre Samples bei
//! jedem `collect()`.
//!
//! Audio-, Processing- und Translation-Collectors lassen sich klonen: Klone
//! teilen die aufgezeichneten Werte, aber jeder Klon führt einen eigenen
//! Zyklus-Cursor. So kann ein Collector pro Session überwacht werden, ohne
//! dass eine Session der anderen die Werte wegliest.

use super::metrics::{
    AudioMetrics, MetricCategory, MetricSample, NetworkMetrics, ProcessingMetrics,
    TranslationMetrics,
};
use crate::audio::analyze_frame;
use crate::connection::ConnectionState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectorError {
    #[error("{category} collector timed out after {timeout_ms}ms")]
    Timeout {
        category: MetricCategory,
        timeout_ms: u64,
    },

    #[error("{category} collector failed: {reason}")]
    Failed {
        category: MetricCategory,
        reason: String,
    },
}

impl CollectorError {
    pub fn category(&self) -> MetricCategory {
        match self {
            CollectorError::Timeout { category, .. } | CollectorError::Failed { category, .. } => {
                *category
            }
        }
    }
}

// ============================================================================
// COLLECTOR TRAIT
// ============================================================================

#[async_trait]
pub trait MetricCollector: Send + Sync {
    fn category(&self) -> MetricCategory;

    async fn collect(&self) -> Result<MetricSample, CollectorError>;
}

/// Fragt alle Collectors parallel ab
///
/// Gibt die erfolgreichen Samples und die Fehler getrennt zurück.
pub async fn collect_all(
    collectors: &[Arc<dyn MetricCollector>],
    timeout: Duration,
) -> (Vec<MetricSample>, Vec<CollectorError>) {
    let results = futures::future::join_all(collectors.iter().map(|collector| async move {
        let category = collector.category();
        match tokio::time::timeout(timeout, collector.collect()).await {
            Ok(Ok(sample)) if sample.category() == category => Ok(sample),
            Ok(Ok(sample)) => Err(CollectorError::Failed {
                category,
                reason: format!("returned a {} sample", sample.category()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CollectorError::Timeout {
                category,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }))
    .await;

    let mut samples = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(sample) => samples.push(sample),
            Err(e) => errors.push(e),
        }
    }
    (samples, errors)
}

// ============================================================================
// NETWORK
// ============================================================================

/// RFC 3550 Glättungsfaktor für Jitter
const JITTER_GAIN: f64 = 1.0 / 16.0;
const STABILITY_PENALTY: f64 = 0.25;
const STABILITY_RECOVERY: f64 = 0.05;

#[derive(Debug)]
struct NetworkState {
    latency: Option<f64>,
    jitter: f64,
    packets_received: u64,
    packets_lost: u64,
    reported_received: u64,
    reported_lost: u64,
    packet_loss: f64,
    bandwidth: Option<f64>,
    stability: f64,
    connected: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            latency: None,
            jitter: 0.0,
            packets_received: 0,
            packets_lost: 0,
            reported_received: 0,
            reported_lost: 0,
            packet_loss: 0.0,
            bandwidth: None,
            stability: 1.0,
            connected: false,
        }
    }
}

/// Netzwerk-Metriken aus RTT-Messungen und Paketzählern
#[derive(Debug, Clone, Default)]
pub struct NetworkStatsCollector {
    state: Arc<Mutex<NetworkState>>,
}

impl NetworkStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Neue RTT-Messung (z.B. aus Ping/Pong)
    pub fn record_rtt(&self, rtt_ms: f64) {
        let mut state = self.state.lock();
        if let Some(previous) = state.latency {
            let d = (rtt_ms - previous).abs();
            state.jitter += (d - state.jitter) * JITTER_GAIN;
        }
        state.latency = Some(rtt_ms);
    }

    /// Kumulative Paketzähler
    pub fn record_packets(&self, received: u64, lost: u64) {
        let mut state = self.state.lock();
        state.packets_received = received;
        state.packets_lost = lost;
    }

    /// Verfügbare Bandbreite in kbit/s
    pub fn record_bandwidth(&self, kbps: f64) {
        self.state.lock().bandwidth = Some(kbps.max(0.0));
    }

    /// Abbrüche kosten Stabilität, erholt wird nur im Zustand `Connected`
    pub fn record_connection_state(&self, connection_state: ConnectionState) {
        let mut state = self.state.lock();
        match connection_state {
            ConnectionState::Connected => state.connected = true,
            ConnectionState::Disconnected => {
                state.connected = false;
                state.stability = (state.stability - STABILITY_PENALTY).max(0.0);
            }
            _ => state.connected = false,
        }
    }
}

#[async_trait]
impl MetricCollector for NetworkStatsCollector {
    fn category(&self) -> MetricCategory {
        MetricCategory::Network
    }

    async fn collect(&self) -> Result<MetricSample, CollectorError> {
        let mut state = self.state.lock();
        let latency = state.latency.ok_or_else(|| CollectorError::Failed {
            category: MetricCategory::Network,
            reason: "no latency samples yet".to_string(),
        })?;

        let received = state.packets_received.saturating_sub(state.reported_received);
        let lost = state.packets_lost.saturating_sub(state.reported_lost);
        if received + lost > 0 {
            state.packet_loss = lost as f64 / (received + lost) as f64;
        }
        state.reported_received = state.packets_received;
        state.reported_lost = state.packets_lost;

        let metrics = NetworkMetrics {
            latency,
            jitter: state.jitter,
            packet_loss: state.packet_loss,
            bandwidth: state.bandwidth.unwrap_or(NetworkMetrics::default().bandwidth),
            stability: state.stability,
        };
        if state.connected {
            state.stability = (state.stability + STABILITY_RECOVERY).min(1.0);
        }
        Ok(MetricSample::Network(metrics))
    }
}

// ============================================================================
// AUDIO
// ============================================================================

const LEVEL_SMOOTHING: f64 = 0.2;
/// Untergrenze für Pegel, damit der SNR endlich bleibt
const LEVEL_EPSILON: f64 = 1e-4;
const MAX_SNR_DB: f64 = 60.0;
const NOISE_FLOOR_RISE: f64 = 0.001;

#[derive(Debug, Default)]
struct AudioState {
    level: f64,
    noise_floor: Option<f64>,
    distortion: f64,
    frames: u64,
}

/// Pegel, Rauschboden und Verzerrung aus PCM-Frames
#[derive(Debug, Default)]
pub struct AudioLevelCollector {
    state: Arc<Mutex<AudioState>>,
    /// Frame-Zähler beim letzten eigenen `collect()`
    seen_frames: Mutex<u64>,
}

impl Clone for AudioLevelCollector {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            seen_frames: Mutex::new(*self.seen_frames.lock()),
        }
    }
}

impl AudioLevelCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, samples: &[f32]) {
        let levels = analyze_frame(samples);
        let rms = f64::from(levels.rms);
        let mut state = self.state.lock();

        state.level += (rms - state.level) * LEVEL_SMOOTHING;
        // Rauschboden folgt Minima sofort und steigt nur langsam
        state.noise_floor = Some(match state.noise_floor {
            Some(floor) if rms < floor => rms,
            Some(floor) => floor + (rms - floor) * NOISE_FLOOR_RISE,
            None => rms,
        });
        state.distortion += (f64::from(levels.clipping_ratio) - state.distortion) * LEVEL_SMOOTHING;
        state.frames += 1;
    }
}

#[async_trait]
impl MetricCollector for AudioLevelCollector {
    fn category(&self) -> MetricCategory {
        MetricCategory::Audio
    }

    async fn collect(&self) -> Result<MetricSample, CollectorError> {
        let state = self.state.lock();
        let mut seen = self.seen_frames.lock();
        if state.frames == *seen {
            return Err(CollectorError::Failed {
                category: MetricCategory::Audio,
                reason: "no audio frames since last cycle".to_string(),
            });
        }
        *seen = state.frames;

        let level = state.level.max(LEVEL_EPSILON);
        let noise = state.noise_floor.unwrap_or(0.0).max(LEVEL_EPSILON).min(level);
        let signal_to_noise = (20.0 * (level / noise).log10()).clamp(0.0, MAX_SNR_DB);
        let distortion = state.distortion.clamp(0.0, 1.0);
        let clarity = ((signal_to_noise / 40.0).min(1.0) * (1.0 - distortion)).clamp(0.0, 1.0);

        Ok(MetricSample::Audio(AudioMetrics {
            level: state.level,
            noise,
            signal_to_noise,
            clarity,
            distortion,
        }))
    }
}

// ============================================================================
// PROCESSING
// ============================================================================

/// Kürzere Abstände liefern bei sysinfo keine sinnvolle CPU-Last
const CPU_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

struct ProcessingState {
    system: System,
    frames: u64,
    refreshed_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct ProcessingCursor {
    frames: u64,
    at: Instant,
}

/// CPU/Memory des Hosts (sysinfo) und verarbeitete Frames pro Sekunde
pub struct ProcessingCollector {
    state: Arc<Mutex<ProcessingState>>,
    cursor: Mutex<ProcessingCursor>,
}

impl ProcessingCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            state: Arc::new(Mutex::new(ProcessingState {
                system,
                frames: 0,
                refreshed_at: None,
            })),
            cursor: Mutex::new(ProcessingCursor {
                frames: 0,
                at: Instant::now(),
            }),
        }
    }

    pub fn record_frames(&self, count: u64) {
        self.state.lock().frames += count;
    }
}

impl Clone for ProcessingCollector {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            cursor: Mutex::new(*self.cursor.lock()),
        }
    }
}

impl Default for ProcessingCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricCollector for ProcessingCollector {
    fn category(&self) -> MetricCategory {
        MetricCategory::Processing
    }

    async fn collect(&self) -> Result<MetricSample, CollectorError> {
        let mut state = self.state.lock();
        let stale = state
            .refreshed_at
            .map(|at| at.elapsed() >= CPU_REFRESH_INTERVAL)
            .unwrap_or(true);
        if stale {
            state.system.refresh_cpu();
            state.system.refresh_memory();
            state.refreshed_at = Some(Instant::now());
        }

        let total = state.system.total_memory();
        if total == 0 {
            return Err(CollectorError::Failed {
                category: MetricCategory::Processing,
                reason: "total memory unavailable".to_string(),
            });
        }
        let memory_usage = state.system.used_memory() as f64 / total as f64 * 100.0;
        let cpu_usage = f64::from(state.system.global_cpu_info().cpu_usage());
        let cpu_usage = if cpu_usage.is_finite() { cpu_usage } else { 0.0 };

        let mut cursor = self.cursor.lock();
        let elapsed = cursor.at.elapsed().as_secs_f64();
        let frames = state.frames.saturating_sub(cursor.frames);
        let throughput = if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        };
        *cursor = ProcessingCursor {
            frames: state.frames,
            at: Instant::now(),
        };

        Ok(MetricSample::Processing(ProcessingMetrics {
            cpu_usage: cpu_usage.clamp(0.0, 100.0),
            memory_usage: memory_usage.clamp(0.0, 100.0),
            throughput,
        }))
    }
}

// ============================================================================
// TRANSLATION
// ============================================================================

/// Kumulative Zähler
#[derive(Debug, Clone, Copy, Default)]
struct TranslationState {
    completed: u64,
    partial: u64,
    failed: u64,
    confidence_sum: f64,
}

/// Verdichtet Übersetzungsergebnisse seit dem letzten Zyklus
#[derive(Debug, Default)]
pub struct TranslationStatsCollector {
    state: Arc<Mutex<TranslationState>>,
    /// Zählerstand beim letzten eigenen `collect()`
    seen: Mutex<TranslationState>,
}

impl Clone for TranslationStatsCollector {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            seen: Mutex::new(*self.seen.lock()),
        }
    }
}

impl TranslationStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, confidence: f64) {
        let mut state = self.state.lock();
        state.completed += 1;
        state.confidence_sum += confidence.clamp(0.0, 1.0);
    }

    pub fn record_partial(&self, confidence: f64) {
        let mut state = self.state.lock();
        state.partial += 1;
        state.confidence_sum += confidence.clamp(0.0, 1.0);
    }

    pub fn record_failure(&self) {
        self.state.lock().failed += 1;
    }
}

#[async_trait]
impl MetricCollector for TranslationStatsCollector {
    fn category(&self) -> MetricCategory {
        MetricCategory::Translation
    }

    async fn collect(&self) -> Result<MetricSample, CollectorError> {
        let current = *self.state.lock();
        let mut seen = self.seen.lock();
        let completed = current.completed - seen.completed;
        let partial = current.partial - seen.partial;
        let failed = current.failed - seen.failed;
        let confidence_sum = current.confidence_sum - seen.confidence_sum;

        let total = completed + partial + failed;
        if total == 0 {
            return Err(CollectorError::Failed {
                category: MetricCategory::Translation,
                reason: "no translations since last cycle".to_string(),
            });
        }

        let answered = completed + partial;
        let metrics = TranslationMetrics {
            accuracy: completed as f64 / total as f64,
            confidence: if answered > 0 {
                (confidence_sum / answered as f64).clamp(0.0, 1.0)
            } else {
                0.0
            },
            error_rate: failed as f64 / total as f64,
        };
        *seen = current;
        Ok(MetricSample::Translation(metrics))
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;

    /// Liefert immer den gleichen Sample
    pub struct FixedCollector(pub MetricSample);

    #[async_trait]
    impl MetricCollector for FixedCollector {
        fn category(&self) -> MetricCategory {
            self.0.category()
        }

        async fn collect(&self) -> Result<MetricSample, CollectorError> {
            Ok(self.0)
        }
    }

    /// Antwortet nie
    pub struct HangingCollector(pub MetricCategory);

    #[async_trait]
    impl MetricCollector for HangingCollector {
        fn category(&self) -> MetricCategory {
            self.0
        }

        async fn collect(&self) -> Result<MetricSample, CollectorError> {
            std::future::pending().await
        }
    }

    /// Schlägt immer fehl
    pub struct FailingCollector(pub MetricCategory);

    #[async_trait]
    impl MetricCollector for FailingCollector {
        fn category(&self) -> MetricCategory {
            self.0
        }

        async fn collect(&self) -> Result<MetricSample, CollectorError> {
            Err(CollectorError::Failed {
                category: self.0,
                reason: "sensor offline".to_string(),
            })
        }
    }

    /// Wert kann zwischen Zyklen geändert werden
    #[derive(Clone)]
    pub struct SharedNetworkCollector(pub Arc<Mutex<NetworkMetrics>>);

    #[async_trait]
    impl MetricCollector for SharedNetworkCollector {
        fn category(&self) -> MetricCategory {
            MetricCategory::Network
        }

        async fn collect(&self) -> Result<MetricSample, CollectorError> {
            Ok(MetricSample::Network(*self.0.lock()))
        }
    }
}
