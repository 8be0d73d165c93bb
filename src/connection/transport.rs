//! Schnittstelle zum darunterliegenden WebRTC Transport
//!
//! Die Session arbeitet nur gegen `PeerTransport`. Callbacks des Transports
//! kommen als `TransportEvent` über einen Channel zurück, nicht als Closures.

use crate::audio::AudioPacket;
use crate::config::DataChannelConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Data channel {0} not available")]
    NoDataChannel(String),

    #[error("Transport closed")]
    Closed,
}

// ============================================================================
// SIGNALING TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
}

/// Session Description (Offer/Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn pranswer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Pranswer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

// ============================================================================
// TRANSPORT STATES
// ============================================================================

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Vorübergehend, kein Cleanup
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Kumulierte Zähler eines Stats-Durchlaufs
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Geschätzte Senderate des aktiven Candidate-Paars
    pub available_bitrate_kbps: Option<f64>,
}

/// Callbacks des Transports als Nachrichten
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
    IceGatheringStateChanged(IceGatheringState),
    /// Lokal gesammelter Candidate, muss per Signaling verschickt werden
    LocalCandidate(IceCandidate),
    DataChannelOpened {
        label: String,
        ordered: bool,
        max_retransmits: Option<u16>,
    },
    DataChannelMessage {
        label: String,
        data: Vec<u8>,
    },
    DataChannelClosed {
        label: String,
    },
    RemoteTrack {
        track_id: String,
    },
    NetworkStats(TransportStats),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Offer/Answer/Candidate-Primitive einer einzelnen Peer Connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Legt einen Data Channel an; `DataChannelOpened` folgt als Event
    async fn create_data_channel(&self, config: &DataChannelConfig)
        -> Result<(), TransportError>;

    async fn send_data(&self, label: &str, payload: String) -> Result<(), TransportError>;

    async fn close_data_channel(&self, label: &str) -> Result<(), TransportError>;

    async fn send_audio(&self, packet: &AudioPacket) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt pro Peer einen neuen Transport
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_json() {
        let desc = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_ice_candidate_browser_format() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }
}
