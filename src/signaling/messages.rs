//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt `{ "type": ..., "data": { ... } }`.
//! `peerId` ist bei ausgehenden Nachrichten der Empfänger, bei eingehenden
//! der Absender; der Server schreibt das Feld beim Weiterleiten um.

use crate::connection::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        peer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        peer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        peer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined { peer_id: String },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { peer_id: String },

    /// Client → Server: Raum betreten
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, peer_id: String },

    /// Client → Server: Raum verlassen
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, peer_id: String },
}

impl SignalingMessage {
    pub fn offer(peer_id: impl Into<String>, offer: SessionDescription) -> Self {
        SignalingMessage::Offer {
            offer,
            peer_id: peer_id.into(),
        }
    }

    pub fn answer(peer_id: impl Into<String>, answer: SessionDescription) -> Self {
        SignalingMessage::Answer {
            answer,
            peer_id: peer_id.into(),
        }
    }

    pub fn ice_candidate(peer_id: impl Into<String>, candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            candidate,
            peer_id: peer_id.into(),
        }
    }

    /// Der Peer, auf den sich die Nachricht bezieht
    pub fn peer_id(&self) -> &str {
        match self {
            SignalingMessage::Offer { peer_id, .. }
            | SignalingMessage::Answer { peer_id, .. }
            | SignalingMessage::IceCandidate { peer_id, .. }
            | SignalingMessage::ParticipantJoined { peer_id }
            | SignalingMessage::ParticipantLeft { peer_id }
            | SignalingMessage::JoinRoom { peer_id, .. }
            | SignalingMessage::LeaveRoom { peer_id, .. } => peer_id,
        }
    }

    /// Name des `type` Felds, für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::ParticipantJoined { .. } => "participant-joined",
            SignalingMessage::ParticipantLeft { .. } => "participant-left",
            SignalingMessage::JoinRoom { .. } => "join-room",
            SignalingMessage::LeaveRoom { .. } => "leave-room",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
