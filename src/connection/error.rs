//! Fehlertypen des Connection Lifecycle Managers

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Session for peer {0} already exists")]
    DuplicateSession(String),

    #[error("No session for peer {0}")]
    SessionNotFound(String),

    #[error("Failed to apply session description for peer {peer_id}: {reason}")]
    SignalingApply { peer_id: String, reason: String },

    #[error("Invalid signaling state for peer {peer_id}: {reason}")]
    InvalidState { peer_id: String, reason: String },

    #[error("Failed to apply ICE candidate for peer {peer_id}: {reason}")]
    CandidateApply { peer_id: String, reason: String },

    #[error("Peer {peer_id} did not connect within {timeout_ms}ms")]
    ConnectTimeout { peer_id: String, timeout_ms: u64 },

    #[error("Transport error for peer {peer_id}: {reason}")]
    Transport { peer_id: String, reason: String },

    #[error("Data channel error for peer {peer_id}: {reason}")]
    DataChannel { peer_id: String, reason: String },

    #[error("Session for peer {0} is closing")]
    SessionClosed(String),
}

impl ConnectionError {
    /// Fehler, nach denen die Session beendet wird
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::SignalingApply { .. }
                | ConnectionError::ConnectTimeout { .. }
                | ConnectionError::Transport { .. }
        )
    }

    /// Ein erneuter Versuch (neue Session) kann sinnvoll sein
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectTimeout { .. } | ConnectionError::Transport { .. }
        )
    }

    /// Peer ID auf die sich der Fehler bezieht
    pub fn peer_id(&self) -> &str {
        match self {
            ConnectionError::DuplicateSession(peer_id)
            | ConnectionError::SessionNotFound(peer_id)
            | ConnectionError::SessionClosed(peer_id) => peer_id,
            ConnectionError::SignalingApply { peer_id, .. }
            | ConnectionError::InvalidState { peer_id, .. }
            | ConnectionError::CandidateApply { peer_id, .. }
            | ConnectionError::ConnectTimeout { peer_id, .. }
            | ConnectionError::Transport { peer_id, .. }
            | ConnectionError::DataChannel { peer_id, .. } => peer_id,
        }
    }
}
