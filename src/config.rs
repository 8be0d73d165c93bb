//! Konfiguration der Room Engine
//!
//! Alle Komponenten bekommen ihre Konfiguration explizit über den Konstruktor
//! übergeben. Die JSON-Schlüssel folgen der camelCase-Konvention des
//! Signaling-Protokolls (`connectionTimeoutMs`, `quality.alertCooldownMs`, ...).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Gesamtkonfiguration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Timeout für den Verbindungsaufbau pro Peer (ms)
    pub connection_timeout_ms: u64,
    pub connection: ConnectionConfig,
    pub quality: QualityConfig,
    pub streaming: StreamingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 30_000,
            connection: ConnectionConfig::default(),
            quality: QualityConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Lädt die Konfiguration aus einem JSON-String
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Prüft alle Werte auf Konsistenz
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connectionTimeoutMs must be greater than 0".to_string(),
            ));
        }
        self.connection.validate()?;
        self.quality.validate()?;
        self.streaming.validate()?;
        Ok(())
    }

    /// Kleine Puffer, schnelle Reaktion
    pub fn low_latency() -> Self {
        let mut config = Self {
            connection_timeout_ms: 15_000,
            ..Default::default()
        };
        config.connection.data_channel.ordered = false;
        config.connection.data_channel.max_retransmits = Some(0);
        config.quality.monitoring_interval_ms = 500;
        config.streaming = StreamingConfig {
            // ein 20 ms Frame (48 kHz, 16 bit mono) als Ziel, zwei als Obergrenze
            min_buffer_size: 960,
            target_buffer_size: 1920,
            max_buffer_size: 3840,
            buffer_floor: 3840,
            buffer_ceiling: 15_360,
            target_latency_ms: 80,
            max_latency_ms: 200,
            flush_interval_ms: 40,
            ..Default::default()
        };
        config
    }

    /// Größere Puffer für instabile (mobile) Netze
    pub fn resilient() -> Self {
        let mut config = Self {
            connection_timeout_ms: 45_000,
            ..Default::default()
        };
        config.connection.ping_interval_ms = 2_000;
        config.quality.thresholds.latency = 400.0;
        config.quality.thresholds.packet_loss = 0.08;
        config.streaming = StreamingConfig {
            min_buffer_size: 2048,
            target_buffer_size: 4096,
            max_buffer_size: 8192,
            buffer_floor: 4096,
            buffer_ceiling: 32_768,
            target_latency_ms: 200,
            max_latency_ms: 600,
            ..Default::default()
        };
        config
    }
}

// ============================================================================
// CONNECTION CONFIG
// ============================================================================

/// ICE Server (STUN oder TURN)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Einstellungen für den Control/Translation Data Channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DataChannelConfig {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: "control".to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub data_channel: DataChannelConfig,
    /// Intervall für automatische Pings über den Data Channel, 0 = aus
    pub ping_interval_ms: u64,
    /// Intervall für Transport-Statistiken (Verlust, Bandbreite), 0 = aus
    pub stats_interval_ms: u64,
    /// Kapazität der Command-Queue pro Session
    pub command_queue_size: usize,
    /// Kapazität des Event-Broadcasts
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: String::new(),
                credential: String::new(),
            }],
            data_channel: DataChannelConfig::default(),
            ping_interval_ms: 5_000,
            stats_interval_ms: 1_000,
            command_queue_size: 64,
            event_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.data_channel.label.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.dataChannel.label must not be empty".to_string(),
            ));
        }
        if self.command_queue_size == 0 || self.event_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection queue sizes must be greater than 0".to_string(),
            ));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "ICE server entry without urls".to_string(),
                ));
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(ConfigError::InvalidConfig(format!(
                        "ICE server url must start with stun:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// QUALITY CONFIG
// ============================================================================

/// Alarm-Schwellwerte (Warning-Stufe)
///
/// `latency` in ms, `packet_loss` als Anteil (0.05 = 5%), CPU/Memory in Prozent,
/// `signal_to_noise` in dB, `confidence` als Anteil.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityThresholds {
    pub latency: f64,
    pub jitter: f64,
    pub packet_loss: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub signal_to_noise: f64,
    pub confidence: f64,
    /// Faktor, ab dem aus einer Warning ein Critical wird
    pub critical_factor: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            latency: 200.0,
            jitter: 50.0,
            packet_loss: 0.05,
            cpu_usage: 80.0,
            memory_usage: 85.0,
            signal_to_noise: 10.0,
            confidence: 0.6,
            critical_factor: 2.0,
        }
    }
}

/// Auslöser der Optimierungsregeln
///
/// Liegen bewusst vor den Alarm-Schwellwerten: Empfehlungen sollen greifen,
/// bevor ein Alarm fällig wird. Einheiten wie bei `QualityThresholds`,
/// Bandbreite in kbit/s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleThresholds {
    pub latency: f64,
    pub packet_loss: f64,
    pub jitter: f64,
    pub cpu_usage: f64,
    pub signal_to_noise: f64,
    pub confidence: f64,
    pub min_bandwidth: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            latency: 200.0,
            packet_loss: 0.03,
            jitter: 30.0,
            cpu_usage: 80.0,
            signal_to_noise: 15.0,
            confidence: 0.7,
            min_bandwidth: 128.0,
        }
    }
}

/// Gewichtung der Teil-Scores
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub audio: f64,
    pub network: f64,
    pub processing: f64,
    pub translation: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            audio: 0.3,
            network: 0.3,
            processing: 0.2,
            translation: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.audio + self.network + self.processing + self.translation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityConfig {
    pub monitoring_interval_ms: u64,
    pub alert_cooldown_ms: u64,
    /// Maximale Wartezeit pro Collector und Zyklus
    pub collector_timeout_ms: u64,
    /// Länge der rollierenden Snapshot-Historie
    pub history_size: usize,
    pub max_recommendations: usize,
    pub max_alerts: usize,
    /// Anzahl Samples für die Trend-Erkennung
    pub trend_window: usize,
    pub thresholds: QualityThresholds,
    pub rules: RuleThresholds,
    pub weights: ScoreWeights,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: 1_000,
            alert_cooldown_ms: 30_000,
            collector_timeout_ms: 500,
            history_size: 300,
            max_recommendations: 50,
            max_alerts: 100,
            trend_window: 10,
            thresholds: QualityThresholds::default(),
            rules: RuleThresholds::default(),
            weights: ScoreWeights::default(),
        }
    }
}

impl QualityConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "quality.monitoringIntervalMs must be greater than 0".to_string(),
            ));
        }
        if self.collector_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "quality.collectorTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.history_size == 0 || self.max_recommendations == 0 || self.max_alerts == 0 {
            return Err(ConfigError::InvalidConfig(
                "quality history and list sizes must be greater than 0".to_string(),
            ));
        }
        if self.trend_window < 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "quality.trendWindow must be at least 2, got {}",
                self.trend_window
            )));
        }
        if self.thresholds.critical_factor < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "quality.thresholds.criticalFactor must be >= 1.0, got {}",
                self.thresholds.critical_factor
            )));
        }
        let r = &self.rules;
        if [r.latency, r.jitter, r.cpu_usage, r.signal_to_noise, r.min_bandwidth]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || !(0.0..=1.0).contains(&r.packet_loss)
            || !(0.0..=1.0).contains(&r.confidence)
        {
            return Err(ConfigError::InvalidConfig(
                "quality.rules values must be non-negative, packetLoss and confidence within 0..1"
                    .to_string(),
            ));
        }
        let w = &self.weights;
        if [w.audio, w.network, w.processing, w.translation]
            .iter()
            .any(|v| *v < 0.0)
            || w.total() <= 0.0
        {
            return Err(ConfigError::InvalidConfig(
                "quality.weights must be non-negative with a positive sum".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// STREAMING CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Puffergrößen in Bytes
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    pub target_buffer_size: usize,
    /// Untergrenze und Obergrenze für die adaptive `max_buffer_size`
    pub buffer_floor: usize,
    pub buffer_ceiling: usize,
    pub target_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Flush-Timer pro Zyklus
    pub flush_interval_ms: u64,
    /// Intervall für Größenanpassung und Quality-Stepping
    pub adjust_interval_ms: u64,
    pub grow_factor: f64,
    pub shrink_factor: f64,
    /// Packet Loss ab dem heruntergeschaltet wird (Anteil)
    pub packet_loss_high: f64,
    /// Packet Loss unter dem hochgeschaltet werden darf (Anteil)
    pub packet_loss_low: f64,
    /// Score unter dem immer heruntergeschaltet wird
    pub min_quality_score: f64,
    pub command_queue_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 1024,
            max_buffer_size: 4096,
            target_buffer_size: 2048,
            buffer_floor: 2048,
            buffer_ceiling: 16_384,
            target_latency_ms: 150,
            max_latency_ms: 400,
            flush_interval_ms: 100,
            adjust_interval_ms: 1_000,
            grow_factor: 1.2,
            shrink_factor: 0.8,
            packet_loss_high: 0.05,
            packet_loss_low: 0.01,
            min_quality_score: 30.0,
            command_queue_size: 256,
        }
    }
}

impl StreamingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_buffer_size <= self.target_buffer_size
            && self.target_buffer_size <= self.max_buffer_size)
        {
            return Err(ConfigError::InvalidConfig(format!(
                "streaming buffer sizes must satisfy min <= target <= max, got {} / {} / {}",
                self.min_buffer_size, self.target_buffer_size, self.max_buffer_size
            )));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "streaming.maxBufferSize must be greater than 0".to_string(),
            ));
        }
        if self.buffer_floor > self.max_buffer_size || self.buffer_ceiling < self.max_buffer_size
        {
            return Err(ConfigError::InvalidConfig(format!(
                "streaming.maxBufferSize ({}) must lie within bufferFloor ({}) and bufferCeiling ({})",
                self.max_buffer_size, self.buffer_floor, self.buffer_ceiling
            )));
        }
        if self.buffer_floor < self.min_buffer_size {
            return Err(ConfigError::InvalidConfig(format!(
                "streaming.bufferFloor ({}) must not be below minBufferSize ({})",
                self.buffer_floor, self.min_buffer_size
            )));
        }
        if self.target_latency_ms > self.max_latency_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "streaming.targetLatencyMs ({}) must not exceed maxLatencyMs ({})",
                self.target_latency_ms, self.max_latency_ms
            )));
        }
        if self.flush_interval_ms == 0 || self.adjust_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "streaming intervals must be greater than 0".to_string(),
            ));
        }
        if self.grow_factor <= 1.0 || !(0.0..1.0).contains(&self.shrink_factor) || self.shrink_factor == 0.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "streaming factors must satisfy grow > 1 and 0 < shrink < 1, got {} / {}",
                self.grow_factor, self.shrink_factor
            )));
        }
        if self.packet_loss_low > self.packet_loss_high {
            return Err(ConfigError::InvalidConfig(
                "streaming.packetLossLow must not exceed packetLossHigh".to_string(),
            ));
        }
        if self.command_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "streaming.commandQueueSize must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
