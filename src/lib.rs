//! Room Engine - P2P Audio Rooms
//!
//! Client-seitige Session-Engine für Audio-Räume:
//! - WebRTC Peer Connections mit ICE Candidate Pufferung
//! - Quality Monitoring mit Alerts und Empfehlungen
//! - Adaptive Puffer und Quality-Stufen pro Stream
//! - WebSocket Signaling

pub mod audio;
pub mod config;
pub mod connection;
pub mod datachannel;
pub mod quality;
pub mod room;
pub mod signaling;
pub mod streaming;
pub mod translation;

pub use audio::{AudioPacket, AudioSource};
pub use config::{ConfigError, EngineConfig};
pub use connection::{ConnectionError, ConnectionEvent, ConnectionManager};
pub use quality::{QualityEngine, QualityError, QualityEvent};
pub use room::{RoomError, RoomEvent, RoomSession};
pub use signaling::{SignalingClient, SignalingError, SignalingMessage, SignalingSink};
pub use streaming::{AdaptiveController, StreamingError};

use connection::WebRtcTransportFactory;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den fmt Subscriber
///
/// `RUST_LOG` hat Vorrang; ein zweiter Aufruf ändert nichts.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("room_engine=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// ENTRY
// ============================================================================

/// Betritt einen Raum und läuft bis Ctrl-C
pub async fn run(
    signaling_url: &str,
    room_id: &str,
    peer_id: &str,
    config: EngineConfig,
) -> Result<(), RoomError> {
    tracing::info!("Starting room engine...");

    let (client, inbound) = SignalingClient::connect(signaling_url).await?;
    let client = Arc::new(client);
    let mut signaling_events = client.subscribe();

    let factory = Arc::new(WebRtcTransportFactory::new(&config.connection));
    let room = RoomSession::new(room_id, peer_id, &config, factory, client);
    let mut room_events = room.subscribe();

    room.attach_signaling(inbound);
    room.join().await?;

    let log_events = tokio::spawn(async move {
        loop {
            match room_events.recv().await {
                Ok(RoomEvent::PeerConnected { peer_id }) => {
                    tracing::info!(peer_id = %peer_id, "Peer joined the room")
                }
                Ok(RoomEvent::PeerLeft { peer_id, reason }) => {
                    tracing::info!(peer_id = %peer_id, "Peer left the room: {}", reason)
                }
                Ok(RoomEvent::Alert(alert)) => tracing::warn!(
                    session_id = %alert.session_id,
                    "Quality alert: {}",
                    alert.message
                ),
                Ok(RoomEvent::Translation { peer_id, payload }) => {
                    tracing::info!(peer_id = %peer_id, "{}", payload.translated_text)
                }
                Ok(RoomEvent::Control { peer_id, data }) => {
                    tracing::debug!(peer_id = %peer_id, "Control message: {}", data)
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} room events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Ctrl-C received, leaving room");
        }
        _ = wait_for_disconnect(&mut signaling_events) => {
            tracing::warn!("Signaling connection lost, leaving room");
        }
    }

    room.shutdown().await;
    log_events.abort();
    Ok(())
}

async fn wait_for_disconnect(events: &mut tokio::sync::broadcast::Receiver<signaling::SignalingEvent>) {
    loop {
        match events.recv().await {
            Ok(signaling::SignalingEvent::Disconnected) | Err(RecvError::Closed) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
}
