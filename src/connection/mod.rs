//! Connection Lifecycle Manager
//!
//! Dieses Modul verwaltet die Peer Connections eines Raums:
//! - Signaling-Zustandsmaschine pro Peer
//! - Puffern von ICE Candidates bis zur Remote Description
//! - Data Channel für Control/Translation Nachrichten
//! - Connect-Timeout und garantiertes Aufräumen

mod candidate_queue;
mod error;
mod events;
mod manager;
mod session;
mod transport;
mod webrtc_transport;

#[cfg(test)]
pub(crate) mod fake;

pub use candidate_queue::CandidateQueue;
pub use error::ConnectionError;
pub use events::{CloseReason, ConnectionEvent};
pub use manager::ConnectionManager;
pub use session::{
    CandidateDisposition, ConnectTimeout, DataChannelSession, DataChannelState, PeerSessionInfo,
    SignalingState, TimeoutState,
};
pub use transport::{
    ConnectionState, IceCandidate, IceGatheringState, PeerTransport, SdpType,
    SessionDescription, TransportError, TransportEvent, TransportEventSender, TransportFactory,
    TransportStats,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
