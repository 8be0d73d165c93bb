//! Events des Connection Lifecycle Managers

use super::error::ConnectionError;
use super::session::{DataChannelState, SignalingState};
use super::transport::{ConnectionState, IceCandidate, IceGatheringState, TransportStats};
use crate::datachannel::DataChannelMessage;

/// Warum eine Session geschlossen wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close_session` / `close_all`
    Requested,
    /// Transport meldet `closed`
    RemoteClosed,
    /// Manager wurde verworfen
    Shutdown,
}

/// Events die vom ConnectionManager ausgelöst werden
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    SessionCreated {
        peer_id: String,
    },
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    SignalingStateChanged {
        peer_id: String,
        state: SignalingState,
    },
    IceGatheringChanged {
        peer_id: String,
        state: IceGatheringState,
    },
    /// Muss über den Signaling-Kanal an den Peer gehen
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    CandidatesFlushed {
        peer_id: String,
        applied: usize,
        failed: usize,
    },
    CandidateFailed {
        peer_id: String,
        error: ConnectionError,
    },
    DataChannelStateChanged {
        peer_id: String,
        label: String,
        state: DataChannelState,
    },
    /// `translation` und `control` Nachrichten vom Peer
    DataMessage {
        peer_id: String,
        message: DataChannelMessage,
    },
    LatencyMeasured {
        peer_id: String,
        rtt_ms: f64,
    },
    RemoteTrack {
        peer_id: String,
        track_id: String,
    },
    /// Periodische Transport-Statistik
    NetworkStats {
        peer_id: String,
        stats: TransportStats,
    },
    /// Terminal: Session wurde wegen eines Fehlers abgebaut
    Failed {
        peer_id: String,
        error: ConnectionError,
    },
    /// Terminal: Session wurde geschlossen
    Closed {
        peer_id: String,
        reason: CloseReason,
    },
}

impl ConnectionEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            ConnectionEvent::SessionCreated { peer_id }
            | ConnectionEvent::StateChanged { peer_id, .. }
            | ConnectionEvent::SignalingStateChanged { peer_id, .. }
            | ConnectionEvent::IceGatheringChanged { peer_id, .. }
            | ConnectionEvent::LocalCandidate { peer_id, .. }
            | ConnectionEvent::CandidatesFlushed { peer_id, .. }
            | ConnectionEvent::CandidateFailed { peer_id, .. }
            | ConnectionEvent::DataChannelStateChanged { peer_id, .. }
            | ConnectionEvent::DataMessage { peer_id, .. }
            | ConnectionEvent::LatencyMeasured { peer_id, .. }
            | ConnectionEvent::RemoteTrack { peer_id, .. }
            | ConnectionEvent::NetworkStats { peer_id, .. }
            | ConnectionEvent::Failed { peer_id, .. }
            | ConnectionEvent::Closed { peer_id, .. } => peer_id,
        }
    }

    /// Failed oder Closed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Failed { .. } | ConnectionEvent::Closed { .. }
        )
    }
}
